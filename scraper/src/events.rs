use crate::domain::QueryKey;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryEvent {
    Fetched(QueryFetchedEvent),
    Failed(QueryFailedEvent),
    Evicted(QueryEvictedEvent),
}

impl QueryEvent {
    pub fn key(&self) -> &QueryKey {
        match self {
            QueryEvent::Fetched(e) => &e.key,
            QueryEvent::Failed(e) => &e.key,
            QueryEvent::Evicted(e) => &e.key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryFetchedEvent {
    pub key: QueryKey,
    pub attempts: u32,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryFailedEvent {
    pub key: QueryKey,
    pub error: String,
    pub failure_count: u32,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEvictedEvent {
    pub key: QueryKey,
    pub timestamp: u64,
}

/// Helper to get current timestamp in seconds since UNIX epoch
pub fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
