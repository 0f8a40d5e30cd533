//! Error types for the Ratelab service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Ratelab operations.
///
/// Rate limit rejections are never errors; they are ordinary
/// [`Decision`](crate::ratelimit::Decision) outcomes.
#[derive(Error, Debug)]
pub enum RatelabError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RatelabError {
    fn from(err: config::ConfigError) -> Self {
        RatelabError::Config(err.to_string())
    }
}

/// Result type alias for Ratelab operations.
pub type Result<T> = std::result::Result<T, RatelabError>;
