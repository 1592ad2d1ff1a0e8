//! Error types for the Gatekeeper engine.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Malformed rate limit request; nothing was mutated
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The origin counter store could not be reached
    #[error("Origin unavailable: {0}")]
    OriginUnavailable(String),

    /// An origin call did not complete within the configured timeout
    #[error("Origin call timed out after {0:?}")]
    OriginTimeout(Duration),

    /// The origin answered with something that is not a counter
    #[error("Malformed origin response: {0}")]
    MalformedOriginResponse(String),

    /// An internal invariant did not hold
    #[error("Internal error: {0}")]
    Internal(String),

    /// Origin writes are short-circuited by the replay circuit breaker
    #[error("Circuit open after {failures} failures (open for {open_for:?})")]
    CircuitOpen { failures: usize, open_for: Duration },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metric registration errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Redis client errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatekeeperError {
    /// Whether this error must surface to callers of a rate limit decision
    /// instead of being absorbed by the fail-open path.
    pub fn is_malformed(&self) -> bool {
        match self {
            GatekeeperError::MalformedOriginResponse(_) => true,
            GatekeeperError::Redis(e) => e.kind() == redis::ErrorKind::TypeError,
            _ => false,
        }
    }
}

impl From<config::ConfigError> for GatekeeperError {
    fn from(e: config::ConfigError) -> Self {
        GatekeeperError::Config(e.to_string())
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
