use crate::domain::request::QueryRequest;
use crate::domain::{PolicyOverrides, QueryHandle, QueryKey, QueryPolicy};
use crate::ports::{FetchAction, HttpTransport, QueryRunner};
use futures::FutureExt;
use serde_json::Value;
use shared::config::Config;
use shared::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Sport used when a caller does not name one.
pub const DEFAULT_SPORT: &str = "nba";

const SCOPE: &str = "scraper";

const fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

/// The scraper backend's queries, each bound to its cache key, fetch action
/// and caching policy.
#[derive(Clone)]
pub struct ScraperQueries {
    runner: Arc<dyn QueryRunner>,
    transport: Arc<dyn HttpTransport>,
    api_base: Url,
}

impl ScraperQueries {
    pub fn new(
        config: &Config,
        runner: Arc<dyn QueryRunner>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        let mut api_base = Url::parse(config.api_base.trim())
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", config.api_base, e)))?;
        if api_base.cannot_be_a_base() {
            return Err(Error::InvalidUrl(format!(
                "{}: not usable as a base URL",
                config.api_base
            )));
        }
        api_base.set_query(None);
        api_base.set_fragment(None);

        Ok(Self {
            runner,
            transport,
            api_base,
        })
    }

    pub fn api_base(&self) -> &Url {
        &self.api_base
    }

    /// GET `/api/secret-phrases`.
    pub fn secret_phrases(&self, overrides: &PolicyOverrides) -> QueryHandle {
        let policy = QueryPolicy {
            stale_time: minutes(15),
            gc_time: minutes(30),
            retry: 2,
            refetch_on_window_focus: false,
            ..QueryPolicy::default()
        }
        .merge(overrides);

        let url = self.endpoint(&["api", "secret-phrases"], &[]);
        self.run(
            QueryKey::new([SCOPE, "secret-phrases"]),
            self.get_json(url, "Failed to scrape secret phrases"),
            policy,
        )
    }

    /// GET `/api/predictions/outcome?sport=..`, cached per sport.
    pub fn prediction_outcomes(
        &self,
        sport: Option<&str>,
        overrides: &PolicyOverrides,
    ) -> QueryHandle {
        let sport = sport.unwrap_or(DEFAULT_SPORT);
        let policy = QueryPolicy {
            stale_time: minutes(10),
            gc_time: minutes(20),
            retry: 2,
            ..QueryPolicy::default()
        }
        .merge(overrides);

        let url = self.endpoint(&["api", "predictions", "outcome"], &[("sport", sport)]);
        self.run(
            QueryKey::new([SCOPE, "prediction-outcomes", sport]),
            self.get_json(url, "Failed to scrape prediction outcomes"),
            policy,
        )
    }

    /// GET `/api/scrape/advanced?url=..&selector=..`.
    ///
    /// Stays idle unless `url` and `selector` are both non-empty and
    /// `enabled` holds; an `enabled` override can only switch it off.
    pub fn advanced_scrape(
        &self,
        url: &str,
        selector: &str,
        enabled: bool,
        overrides: &PolicyOverrides,
    ) -> QueryHandle {
        let mut policy = QueryPolicy {
            stale_time: minutes(5),
            gc_time: minutes(10),
            retry: 1,
            ..QueryPolicy::default()
        }
        .merge(overrides);
        policy.enabled = policy.enabled && enabled && !url.is_empty() && !selector.is_empty();

        let endpoint = self.endpoint(
            &["api", "scrape", "advanced"],
            &[("url", url), ("selector", selector)],
        );
        self.run(
            QueryKey::new([SCOPE, "advanced", url, selector]),
            self.get_json(endpoint, "Advanced scraping failed"),
            policy,
        )
    }

    /// GET `/api/scrape/odds?sport=..`, refetched every two minutes even
    /// while the consumer is in the background.
    pub fn real_time_odds(&self, sport: Option<&str>, overrides: &PolicyOverrides) -> QueryHandle {
        let sport = sport.unwrap_or(DEFAULT_SPORT);
        let policy = QueryPolicy {
            stale_time: minutes(2),
            gc_time: minutes(5),
            refetch_interval: Some(minutes(2)),
            refetch_interval_in_background: true,
            ..QueryPolicy::default()
        }
        .merge(overrides);

        let url = self.endpoint(&["api", "scrape", "odds"], &[("sport", sport)]);
        self.run(
            QueryKey::new([SCOPE, "realtime-odds", sport]),
            self.get_json(url, "Failed to scrape real-time odds"),
            policy,
        )
    }

    fn run(&self, key: QueryKey, fetch: FetchAction, policy: QueryPolicy) -> QueryHandle {
        debug!("Running query '{}' (enabled: {})", key, policy.enabled);
        self.runner.run_query(QueryRequest::new(key, fetch, policy))
    }

    fn endpoint(&self, path: &[&str], params: &[(&str, &str)]) -> Url {
        let mut url = self.api_base.clone();
        // cannot-be-a-base URLs are rejected in `new`
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(path);
        }
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        url
    }

    fn get_json(&self, url: Url, failure: &'static str) -> FetchAction {
        let transport = Arc::clone(&self.transport);
        Arc::new(move || {
            let transport = Arc::clone(&transport);
            let url = url.clone();
            async move {
                debug!("GET {}", url);
                let response = transport.get(&url).await?;
                if !response.is_success() {
                    warn!("GET {} returned status {}", url, response.status);
                    return Err(Error::Fetch(failure.to_string()));
                }
                serde_json::from_slice::<Value>(&response.body)
                    .map_err(|e| Error::Decode(e.to_string()))
            }
            .boxed()
        })
    }
}

impl std::fmt::Debug for ScraperQueries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScraperQueries")
            .field("api_base", &self.api_base.as_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::response::HttpResponse;
    use crate::domain::{QueryState, QueryStatus};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::watch;

    /// Records every request and only fetches when a test drives it.
    #[derive(Default)]
    struct FakeRunner {
        queries: Mutex<Vec<(QueryRequest, Arc<watch::Sender<QueryState>>)>>,
    }

    impl QueryRunner for FakeRunner {
        fn run_query(&self, request: QueryRequest) -> QueryHandle {
            let (tx, rx) = watch::channel(QueryState::default());
            let handle = QueryHandle::new(request.key.clone(), rx, None);
            self.queries.lock().push((request, Arc::new(tx)));
            handle
        }
    }

    impl FakeRunner {
        fn request(&self, index: usize) -> QueryRequest {
            self.queries.lock()[index].0.clone()
        }

        /// Run one fetch attempt for the recorded query, if it is enabled.
        async fn drive(&self, index: usize) {
            let (request, state) = {
                let queries = self.queries.lock();
                (queries[index].0.clone(), Arc::clone(&queries[index].1))
            };
            if !request.policy.enabled {
                return;
            }
            let outcome = (request.fetch)().await;
            state.send_modify(|s| match outcome {
                Ok(data) => {
                    s.status = QueryStatus::Success;
                    s.data = Some(data);
                }
                Err(err) => {
                    s.status = QueryStatus::Error;
                    s.error = Some(err);
                }
            });
        }
    }

    struct FakeTransport {
        status: u16,
        body: &'static str,
        requests: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn new(status: u16, body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                status,
                body,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for FakeTransport {
        async fn get(&self, url: &Url) -> Result<HttpResponse> {
            self.requests.lock().push(url.to_string());
            Ok(HttpResponse::new(self.status, self.body))
        }
    }

    fn queries_with(
        base: &str,
        transport: Arc<FakeTransport>,
    ) -> (ScraperQueries, Arc<FakeRunner>) {
        let runner = Arc::new(FakeRunner::default());
        let queries =
            ScraperQueries::new(&Config::with_api_base(base), runner.clone(), transport).unwrap();
        (queries, runner)
    }

    #[tokio::test]
    async fn test_secret_phrases_defaults_and_success() {
        let transport = FakeTransport::new(200, r#"{"phrases":["a","b"]}"#);
        let (queries, runner) = queries_with("https://api.example.com", transport.clone());

        let handle = queries.secret_phrases(&PolicyOverrides::default());
        let request = runner.request(0);
        assert_eq!(request.key, QueryKey::new(["scraper", "secret-phrases"]));
        assert_eq!(request.policy.stale_time, minutes(15));
        assert_eq!(request.policy.gc_time, minutes(30));
        assert_eq!(request.policy.retry, 2);
        assert!(!request.policy.refetch_on_window_focus);
        assert!(request.policy.enabled);

        runner.drive(0).await;

        assert_eq!(handle.status(), QueryStatus::Success);
        assert_eq!(handle.data(), Some(json!({"phrases": ["a", "b"]})));
        assert_eq!(
            transport.requests(),
            vec!["https://api.example.com/api/secret-phrases".to_string()]
        );
    }

    #[tokio::test]
    async fn test_retry_override_keeps_other_defaults() {
        let (queries, runner) =
            queries_with("https://api.example.com", FakeTransport::new(200, "{}"));

        queries.secret_phrases(&PolicyOverrides {
            retry: Some(5),
            ..PolicyOverrides::default()
        });

        let policy = runner.request(0).policy;
        assert_eq!(policy.retry, 5);
        assert_eq!(policy.stale_time, minutes(15));
        assert_eq!(policy.gc_time, minutes(30));
        assert!(!policy.refetch_on_window_focus);
    }

    #[tokio::test]
    async fn test_non_success_status_is_fetch_error() {
        let transport = FakeTransport::new(503, "unavailable");
        let (queries, runner) = queries_with("https://api.example.com", transport);

        let overrides = PolicyOverrides::default();
        let handles = [
            (queries.secret_phrases(&overrides), "Failed to scrape secret phrases"),
            (
                queries.prediction_outcomes(None, &overrides),
                "Failed to scrape prediction outcomes",
            ),
            (
                queries.advanced_scrape("https://x.com", ".price", true, &overrides),
                "Advanced scraping failed",
            ),
            (queries.real_time_odds(None, &overrides), "Failed to scrape real-time odds"),
        ];

        for (index, (handle, message)) in handles.iter().enumerate() {
            runner.drive(index).await;
            assert_eq!(handle.status(), QueryStatus::Error);
            assert_eq!(handle.error(), Some(Error::Fetch(message.to_string())));
            assert!(handle.data().is_none());
        }
    }

    #[tokio::test]
    async fn test_unparseable_success_body_is_decode_error() {
        let (queries, runner) =
            queries_with("https://api.example.com", FakeTransport::new(200, "<html>"));

        let handle = queries.secret_phrases(&PolicyOverrides::default());
        runner.drive(0).await;

        assert!(matches!(handle.error(), Some(Error::Decode(_))));
    }

    #[tokio::test]
    async fn test_prediction_outcomes_key_and_url_per_sport() {
        let transport = FakeTransport::new(200, "[]");
        let (queries, runner) = queries_with("https://api.example.com/", transport.clone());

        queries.prediction_outcomes(None, &PolicyOverrides::default());
        queries.prediction_outcomes(Some("nfl"), &PolicyOverrides::default());

        let nba = runner.request(0);
        let nfl = runner.request(1);
        assert_eq!(nba.key, QueryKey::new(["scraper", "prediction-outcomes", "nba"]));
        assert_eq!(nfl.key, QueryKey::new(["scraper", "prediction-outcomes", "nfl"]));
        assert_eq!(nba.policy.stale_time, minutes(10));
        assert_eq!(nba.policy.gc_time, minutes(20));
        assert_eq!(nba.policy.retry, 2);

        runner.drive(0).await;
        runner.drive(1).await;
        assert_eq!(
            transport.requests(),
            vec![
                "https://api.example.com/api/predictions/outcome?sport=nba".to_string(),
                "https://api.example.com/api/predictions/outcome?sport=nfl".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_advanced_scrape_url_is_encoded() {
        let transport = FakeTransport::new(200, r#"{"price":"9.99"}"#);
        let (queries, runner) = queries_with("https://api.example.com", transport.clone());

        let handle =
            queries.advanced_scrape("https://x.com", ".price", true, &PolicyOverrides::default());
        let request = runner.request(0);
        assert_eq!(
            request.key,
            QueryKey::new(["scraper", "advanced", "https://x.com", ".price"])
        );
        assert_eq!(request.policy.stale_time, minutes(5));
        assert_eq!(request.policy.gc_time, minutes(10));
        assert_eq!(request.policy.retry, 1);

        runner.drive(0).await;

        assert_eq!(
            transport.requests(),
            vec![
                "https://api.example.com/api/scrape/advanced?url=https%3A%2F%2Fx.com&selector=.price"
                    .to_string()
            ]
        );
        assert_eq!(handle.data(), Some(json!({"price": "9.99"})));
    }

    #[tokio::test]
    async fn test_advanced_scrape_disabled_never_fetches() {
        let transport = FakeTransport::new(200, "{}");
        let (queries, runner) = queries_with("https://api.example.com", transport.clone());
        let overrides = PolicyOverrides::default();

        let handles = [
            queries.advanced_scrape("", ".price", true, &overrides),
            queries.advanced_scrape("https://x.com", "", true, &overrides),
            queries.advanced_scrape("https://x.com", ".price", false, &overrides),
            queries.advanced_scrape(
                "https://x.com",
                ".price",
                true,
                &PolicyOverrides {
                    enabled: Some(false),
                    ..PolicyOverrides::default()
                },
            ),
        ];

        for (index, handle) in handles.iter().enumerate() {
            assert!(!runner.request(index).policy.enabled);
            runner.drive(index).await;
            assert_eq!(handle.status(), QueryStatus::Pending);
            assert!(handle.error().is_none());
        }
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_real_time_odds_polls_in_background() {
        let transport = FakeTransport::new(200, "{}");
        let (queries, runner) = queries_with("https://api.example.com", transport.clone());

        queries.real_time_odds(Some("nhl"), &PolicyOverrides::default());
        let request = runner.request(0);

        assert_eq!(request.key, QueryKey::new(["scraper", "realtime-odds", "nhl"]));
        assert_eq!(request.policy.stale_time, minutes(2));
        assert_eq!(request.policy.gc_time, minutes(5));
        assert_eq!(request.policy.refetch_interval, Some(minutes(2)));
        assert!(request.policy.refetch_interval_in_background);

        runner.drive(0).await;
        assert_eq!(
            transport.requests(),
            vec!["https://api.example.com/api/scrape/odds?sport=nhl".to_string()]
        );
    }

    #[test]
    fn test_base_url_with_path_prefix() {
        let (queries, _) =
            queries_with("https://host.example/backend/?v=1#top", FakeTransport::new(200, "{}"));

        assert_eq!(queries.api_base().as_str(), "https://host.example/backend/");
        let url = queries.endpoint(&["api", "scrape", "odds"], &[("sport", "nba")]);
        assert_eq!(url.as_str(), "https://host.example/backend/api/scrape/odds?sport=nba");
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let runner = Arc::new(FakeRunner::default());
        let result = ScraperQueries::new(
            &Config::with_api_base("not a url"),
            runner,
            FakeTransport::new(200, "{}"),
        );
        assert!(matches!(result, Err(Error::InvalidUrl(_))));
    }
}
