//! Scraper query client: four preconfigured queries against the scraping
//! backend, expressed over pluggable query-engine and HTTP ports.

pub mod domain;
pub mod events;
pub mod ports;
pub mod queries;

pub use domain::request::QueryRequest;
pub use domain::response::HttpResponse;
pub use domain::{FetchStatus, PolicyOverrides, QueryHandle, QueryKey, QueryPolicy, QueryState, QueryStatus};
pub use events::QueryEvent;
pub use ports::{FetchAction, FetchFuture, HttpTransport, QueryRunner};
pub use queries::{DEFAULT_SPORT, ScraperQueries};
