use std::time::Duration;
use thiserror::Error;

/// Errors raised by the launcher, the poller and settings resolution.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Environment '{container}' did not become ready within {timeout:?}")]
    Timeout { container: String, timeout: Duration },

    #[error("Failed to start command for '{container}': {source}")]
    Spawn {
        container: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No status found for key: {0}")]
    KeyNotFound(String),

    #[error("Unknown environment: {0}")]
    UnknownEnvironment(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Status fetch failed: {0:#}")]
    Fetch(anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Timeouts are the only launch failure worth retrying as a whole.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HarnessError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
