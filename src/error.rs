//! Error types for the Floodgate rate limiter.

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// A category was referenced that the policy registry does not know.
    #[error("Unknown rate limit policy: {0}")]
    UnknownPolicy(String),

    /// A policy failed validation while the registry was being built.
    #[error("Invalid policy for {category}: {reason}")]
    InvalidPolicy { category: String, reason: String },

    /// The distributed counter store could not be reached or timed out.
    #[error("Counter backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The distributed counter store answered with something unexpected.
    #[error("Counter backend internal error: {0}")]
    BackendInternal(String),

    /// The caller is over its quota.
    #[error("Rate limit exceeded for {category}, retry after {retry_after_secs}s")]
    QuotaExceeded {
        category: String,
        retry_after_secs: u64,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FloodgateError {
    /// Whether this error came from the counter backend and should count
    /// against the circuit breaker.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            FloodgateError::BackendUnavailable(_) | FloodgateError::BackendInternal(_)
        )
    }
}

impl From<config::ConfigError> for FloodgateError {
    fn from(err: config::ConfigError) -> Self {
        FloodgateError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for FloodgateError {
    fn from(err: serde_yaml::Error) -> Self {
        FloodgateError::Config(err.to_string())
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
