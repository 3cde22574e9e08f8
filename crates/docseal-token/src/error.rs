//! Error types for token coordination

use thiserror::Error;

/// Result type alias for token operations
pub type Result<T> = std::result::Result<T, TokenError>;

/// Errors outside the classified signing failures
///
/// Signing and authentication failures are reported as
/// [`docseal_core::ClassifiedError`]; this type covers setup concerns.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] docseal_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Driver could not be loaded or initialized
    #[error("Driver unavailable: {0}")]
    DriverUnavailable(String),
}

impl From<serde_json::Error> for TokenError {
    fn from(e: serde_json::Error) -> Self {
        TokenError::Serialization(e.to_string())
    }
}
