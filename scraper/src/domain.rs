use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{Error, Result};
use std::any::Any;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub mod request {
    use super::{QueryKey, QueryPolicy};
    use crate::ports::FetchAction;

    /// Everything the query engine needs to manage one query: where to cache
    /// it, how to fetch it and how to keep it fresh.
    #[derive(Clone)]
    pub struct QueryRequest {
        pub key: QueryKey,
        pub fetch: FetchAction,
        pub policy: QueryPolicy,
    }

    impl QueryRequest {
        pub fn new(key: QueryKey, fetch: FetchAction, policy: QueryPolicy) -> Self {
            Self { key, fetch, policy }
        }
    }

    impl std::fmt::Debug for QueryRequest {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("QueryRequest")
                .field("key", &self.key)
                .field("fetch", &"<fetch action>")
                .field("policy", &self.policy)
                .finish()
        }
    }
}

pub mod response {
    use bytes::Bytes;

    /// Raw HTTP response as seen by a fetch action.
    #[derive(Clone, Debug)]
    pub struct HttpResponse {
        pub status: u16,
        pub body: Bytes,
    }

    impl HttpResponse {
        pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
            Self {
                status,
                body: body.into(),
            }
        }

        pub fn is_success(&self) -> bool {
            (200..300).contains(&self.status)
        }
    }
}

/// Ordered tuple of identifiers naming one cached query.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// True when `prefix` matches the leading parts of this key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// Caching and retry knobs attached to a query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryPolicy {
    /// How long fetched data counts as fresh.
    pub stale_time: Duration,
    /// How long an unobserved entry is retained before eviction.
    pub gc_time: Duration,
    /// Retries after the first failed attempt.
    pub retry: u32,
    pub refetch_on_window_focus: bool,
    pub refetch_interval: Option<Duration>,
    pub refetch_interval_in_background: bool,
    pub enabled: bool,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            gc_time: Duration::from_secs(5 * 60),
            retry: 3,
            refetch_on_window_focus: true,
            refetch_interval: None,
            refetch_interval_in_background: false,
            enabled: true,
        }
    }
}

impl QueryPolicy {
    /// Shallow merge: every field present in `overrides` replaces ours.
    pub fn merge(mut self, overrides: &PolicyOverrides) -> Self {
        if let Some(stale_time) = overrides.stale_time {
            self.stale_time = stale_time;
        }
        if let Some(gc_time) = overrides.gc_time {
            self.gc_time = gc_time;
        }
        if let Some(retry) = overrides.retry {
            self.retry = retry;
        }
        if let Some(on_focus) = overrides.refetch_on_window_focus {
            self.refetch_on_window_focus = on_focus;
        }
        if let Some(every) = overrides.refetch_interval {
            self.refetch_interval = (!every.is_zero()).then_some(every);
        }
        if let Some(in_background) = overrides.refetch_interval_in_background {
            self.refetch_interval_in_background = in_background;
        }
        if let Some(enabled) = overrides.enabled {
            self.enabled = enabled;
        }
        self
    }
}

/// Per-call policy overrides. A zero `refetch_interval` turns interval
/// refetching off.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyOverrides {
    pub stale_time: Option<Duration>,
    pub gc_time: Option<Duration>,
    pub retry: Option<u32>,
    pub refetch_on_window_focus: Option<bool>,
    pub refetch_interval: Option<Duration>,
    pub refetch_interval_in_background: Option<bool>,
    pub enabled: Option<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Pending,
    Success,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Idle,
    Fetching,
}

/// Snapshot of a managed query.
#[derive(Clone, Debug)]
pub struct QueryState {
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub data: Option<Value>,
    pub error: Option<Error>,
    /// Failed attempts in the current (or last) fetch.
    pub failure_count: u32,
    pub failure_reason: Option<Error>,
    pub data_updated_at: Option<Instant>,
    pub is_invalidated: bool,
}

impl Default for QueryState {
    fn default() -> Self {
        Self {
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            data: None,
            error: None,
            failure_count: 0,
            failure_reason: None,
            data_updated_at: None,
            is_invalidated: false,
        }
    }
}

impl QueryState {
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        if self.is_invalidated {
            return true;
        }
        match self.data_updated_at {
            Some(updated_at) => updated_at.elapsed() >= stale_time,
            None => true,
        }
    }

    /// A fetch has completed and no new one is running.
    pub fn is_settled(&self) -> bool {
        self.fetch_status == FetchStatus::Idle && self.status != QueryStatus::Pending
    }
}

/// Consumer view of a managed query.
///
/// Holding a handle keeps the query observed; dropping the last handle for a
/// key lets the engine start that entry's retention timer.
pub struct QueryHandle {
    key: QueryKey,
    state: watch::Receiver<QueryState>,
    _observer: Option<Box<dyn Any + Send + Sync>>,
}

impl QueryHandle {
    pub fn new(
        key: QueryKey,
        state: watch::Receiver<QueryState>,
        observer: Option<Box<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            key,
            state,
            _observer: observer,
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn state(&self) -> QueryState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> QueryStatus {
        self.state.borrow().status
    }

    pub fn data(&self) -> Option<Value> {
        self.state.borrow().data.clone()
    }

    pub fn error(&self) -> Option<Error> {
        self.state.borrow().error.clone()
    }

    pub fn is_fetching(&self) -> bool {
        self.state.borrow().fetch_status == FetchStatus::Fetching
    }

    /// Wait for the next state change.
    pub async fn changed(&mut self) -> Result<QueryState> {
        self.state
            .changed()
            .await
            .map_err(|_| Error::Internal(format!("query '{}' was dropped", self.key)))?;
        Ok(self.state.borrow_and_update().clone())
    }

    /// Wait until a fetch has finished with either data or an error.
    ///
    /// Never resolves for a disabled query that has nothing cached.
    pub async fn settled(&mut self) -> Result<QueryState> {
        let key = &self.key;
        self.state
            .wait_for(QueryState::is_settled)
            .await
            .map(|state| state.clone())
            .map_err(|_| Error::Internal(format!("query '{}' was dropped", key)))
    }
}

impl fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("key", &self.key)
            .field("state", &*self.state.borrow())
            .finish()
    }
}
