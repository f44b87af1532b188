//! Error types for the Heartline service.

use thiserror::Error;

/// Main error type for Heartline operations.
#[derive(Error, Debug)]
pub enum HeartlineError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Outbound HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Gateway server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for HeartlineError {
    fn from(err: config::ConfigError) -> Self {
        HeartlineError::Config(err.to_string())
    }
}

/// Result type alias for Heartline operations.
pub type Result<T> = std::result::Result<T, HeartlineError>;
