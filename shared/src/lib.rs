// shared/src/lib.rs

/// Errors surfaced by scraper queries.
///
/// `Clone` so a failure can be stored in the watched query state and handed
/// to every observer of the same key.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The backend answered with a non-success status.
    #[error("{0}")]
    Fetch(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_fetch(&self) -> bool {
        matches!(self, Error::Fetch(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod config;
