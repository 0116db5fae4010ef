use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimiterError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Rate limit for key '{key}' was removed while waiting")]
    Removed { key: String },

    #[error("Rate limiter has been shut down")]
    Shutdown,

    #[error("Timed out after {waited_ms}ms waiting for a permit")]
    Timeout { waited_ms: u64 },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for LimiterError {
    fn from(e: config::ConfigError) -> Self {
        LimiterError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LimiterError>;
