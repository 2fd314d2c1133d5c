//! Error types for Sweelimiter.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Sweelimiter operations.
///
/// Exceeding a limit is not an error: it is reported through a
/// [`LimiterResult`](crate::ratelimit::LimiterResult) and routed to the
/// configured [`ErrorHandler`](crate::handler::ErrorHandler).
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Malformed interval, non-positive quota or empty limit set.
    /// Raised while wiring the application, never per request.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The counter store could not be reached
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The counter store did not answer within the engine timeout
    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Shorthand for a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        LimiterError::Configuration(msg.into())
    }

    /// Whether this error came from the counter store rather than from wiring.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            LimiterError::BackendUnavailable(_) | LimiterError::Timeout(_)
        )
    }
}

/// Result type alias for Sweelimiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
