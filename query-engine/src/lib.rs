pub mod moka_query_client;
pub mod reqwest_transport;
pub mod retry;

pub use moka_query_client::MokaQueryClient;
pub use reqwest_transport::ReqwestTransport;
pub use retry::RetryBackoff;

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::{PolicyOverrides, QueryStatus, ScraperQueries};
    use serde_json::json;
    use shared::Error;
    use shared::config::Config;
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn scraper_for(server: &MockServer) -> (ScraperQueries, MokaQueryClient) {
        let config = Config::with_api_base(server.uri());
        let client = MokaQueryClient::new(
            None,
            RetryBackoff::new(Duration::from_millis(1), Duration::from_millis(5)),
        );
        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let queries =
            ScraperQueries::new(&config, Arc::new(client.clone()), Arc::new(transport)).unwrap();
        (queries, client)
    }

    #[tokio::test]
    async fn test_advanced_scrape_issues_one_encoded_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/scrape/advanced"))
            .and(query_param("url", "https://x.com"))
            .and(query_param("selector", ".price"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"price": "9.99"})))
            .expect(1)
            .mount(&server)
            .await;

        let (queries, _client) = scraper_for(&server);
        let mut handle =
            queries.advanced_scrape("https://x.com", ".price", true, &PolicyOverrides::default());
        let state = handle.settled().await.unwrap();

        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data, Some(json!({"price": "9.99"})));

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(
            received[0].url.query(),
            Some("url=https%3A%2F%2Fx.com&selector=.price")
        );
    }

    #[tokio::test]
    async fn test_same_sport_is_fetched_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/scrape/odds"))
            .and(query_param("sport", "nba"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"games": []}))
                    .set_delay(Duration::from_millis(30)),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/scrape/odds"))
            .and(query_param("sport", "nfl"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"games": [1]})))
            .expect(1)
            .mount(&server)
            .await;

        let (queries, client) = scraper_for(&server);
        let overrides = PolicyOverrides::default();
        let mut first = queries.real_time_odds(None, &overrides);
        let mut second = queries.real_time_odds(Some("nba"), &overrides);
        let mut nfl = queries.real_time_odds(Some("nfl"), &overrides);

        first.settled().await.unwrap();
        second.settled().await.unwrap();
        nfl.settled().await.unwrap();

        assert_eq!(first.data(), Some(json!({"games": []})));
        assert_eq!(nfl.data(), Some(json!({"games": [1]})));
        assert_eq!(client.query_count(), 2);
    }

    #[tokio::test]
    async fn test_server_error_surfaces_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/predictions/outcome"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let (queries, _client) = scraper_for(&server);
        let mut handle = queries.prediction_outcomes(None, &PolicyOverrides::default());
        let state = handle.settled().await.unwrap();

        assert_eq!(state.status, QueryStatus::Error);
        assert_eq!(
            state.error,
            Some(Error::Fetch("Failed to scrape prediction outcomes".to_string()))
        );
        assert_eq!(state.failure_count, 3);
    }
}
