//! Error types for the callback listener and session exchange.

use std::time::Duration;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, OAuthError>;

/// Errors that can occur while authenticating.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    /// No redirect reached the callback listener in time.
    #[error("auth timeout")]
    Timeout(Duration),

    /// The wait was cancelled by the caller.
    #[error("Authentication cancelled")]
    Cancelled,

    /// Binding the callback listener failed.
    #[error("Failed to bind callback listener on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// Network/HTTP error.
    #[error("Network error: {0}")]
    Network(String),

    /// The identity provider rejected the exchange.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Invalid request or URL.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for OAuthError {
    fn from(e: reqwest::Error) -> Self {
        OAuthError::Network(e.to_string())
    }
}

impl From<url::ParseError> for OAuthError {
    fn from(e: url::ParseError) -> Self {
        OAuthError::InvalidRequest(e.to_string())
    }
}
