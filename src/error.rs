//! Error types for the webhook service
//!
//! Crate-level errors cover startup and wiring: configuration, catalog
//! loading, store connection. Per-request errors live in
//! [`crate::webhook::error`] and [`crate::store::StoreError`].

use thiserror::Error;

use crate::store::StoreError;
use crate::webhook::config::ConfigError;

/// The main error type for service setup
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Store could not be opened or initialised
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Generic(String),
}

/// Result type alias for service setup
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a generic error from a string
    pub fn generic<S: Into<String>>(msg: S) -> Self {
        Error::Generic(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = Error::from(ConfigError::Missing("WEBHOOK_SIGNING_SECRET"));
        assert!(err.to_string().starts_with("Configuration error"));
        assert!(err.to_string().contains("WEBHOOK_SIGNING_SECRET"));
    }

    #[test]
    fn test_store_error_display() {
        let err = Error::from(StoreError::Unavailable("connection refused".into()));
        assert_eq!(
            err.to_string(),
            "Store error: Store unavailable: connection refused"
        );
    }

    #[test]
    fn test_generic_error() {
        let err = Error::generic("something went wrong");
        assert_eq!(err.to_string(), "something went wrong");
    }
}
