#![deny(clippy::all)]

use crate::domain::QueryHandle;
use crate::domain::request::QueryRequest;
use crate::domain::response::HttpResponse;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use shared::Result;
use std::sync::Arc;
use url::Url;

// Ports are the pluggable extension points for the query engine and the network

/// Future produced by one fetch attempt
pub type FetchFuture = BoxFuture<'static, Result<Value>>;

/// Re-runnable fetch; the engine calls it once per attempt
pub type FetchAction = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// Port for the managed query engine (deduplication, caching, retry, refetch)
pub trait QueryRunner: Send + Sync + 'static {
    /// Register an observer for `request.key` and start fetching if the policy
    /// calls for it. Must not block.
    fn run_query(&self, request: QueryRequest) -> QueryHandle;
}

/// Port for issuing HTTP GET requests (e.g., reqwest)
#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
    /// Any status counts as a response; only network failures are errors.
    async fn get(&self, url: &Url) -> Result<HttpResponse>;
}
