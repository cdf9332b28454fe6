use std::time::Duration;
use tracing::warn;

/// Runtime settings for the scraper client, resolved once at startup and
/// injected into the components that need them.
#[derive(Clone, Debug)]
pub struct Config {
    pub api_base: String,
    pub request_timeout: Duration,
    pub max_queries: u64,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Config {
    const DEFAULT_API_BASE: &str = "https://pleasing-determination-production.up.railway.app";
    const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
    const DEFAULT_MAX_QUERIES: u64 = 1000;
    const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;
    const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve settings through `lookup`. `SCRAPER_API_BASE` falls back to the
    /// value baked in at build time, then to the public backend.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let api_base = lookup("SCRAPER_API_BASE")
            .filter(|base| !base.trim().is_empty())
            .or_else(|| option_env!("SCRAPER_API_BASE").map(str::to_string))
            .unwrap_or_else(|| Self::DEFAULT_API_BASE.to_string());

        Self {
            api_base,
            request_timeout: Duration::from_secs(parse_or(
                &lookup,
                "SCRAPER_REQUEST_TIMEOUT_SECS",
                Self::DEFAULT_REQUEST_TIMEOUT_SECS,
            )),
            max_queries: parse_or(&lookup, "SCRAPER_MAX_QUERIES", Self::DEFAULT_MAX_QUERIES),
            retry_base_delay: Duration::from_millis(parse_or(
                &lookup,
                "SCRAPER_RETRY_BASE_DELAY_MS",
                Self::DEFAULT_RETRY_BASE_DELAY_MS,
            )),
            retry_max_delay: Duration::from_millis(parse_or(
                &lookup,
                "SCRAPER_RETRY_MAX_DELAY_MS",
                Self::DEFAULT_RETRY_MAX_DELAY_MS,
            )),
        }
    }

    /// Same settings as `from_env` with an explicit base URL.
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            ..Self::from_lookup(|_| None)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_or(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> u64 {
    match lookup(name) {
        Some(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", name, raw, default);
            default
        }),
        None => default,
    }
}
