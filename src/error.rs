use std::path::PathBuf;

use thiserror::Error;

/// Outcome of a `record_request` that did not produce a count.
///
/// None of these mean the service is unhealthy. A caller that gets one has
/// no guarantee the event was recorded and may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CounterError {
    #[error("deadline elapsed before the request was recorded")]
    Timeout,
    #[error("request was cancelled before it was recorded")]
    Cancelled,
    #[error("counter is closed and no longer accepts requests")]
    Closed,
}

impl CounterError {
    /// `Timeout` and `Cancelled` may succeed if tried again; `Closed` won't.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CounterError::Timeout | CounterError::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot decode snapshot {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("store is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Why a counter could not be opened.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot load persisted window: {0}")]
    Load(#[from] StoreError),
}
