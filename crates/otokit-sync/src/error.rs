//! Error types for the orchestrator and run controller.

use crate::state::RunState;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised while running a sync.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The session exchange with the identity provider failed. Fatal.
    #[error("Auth exchange failed: {0}")]
    AuthExchange(String),

    /// Fetching one (difficulty, genre) pair failed. Skipped.
    #[error("Crawl failed for difficulty {difficulty} genre {}: {message}", .genre.as_deref().unwrap_or("-"))]
    Crawl {
        difficulty: i32,
        genre: Option<String>,
        message: String,
    },

    /// Uploading to one endpoint failed. Skipped.
    #[error("Upload to {endpoint} failed: {message}")]
    Upload { endpoint: String, message: String },

    /// Callback listener error, including the auth timeout.
    #[error(transparent)]
    OAuth(#[from] otokit_oauth::OAuthError),

    /// Tunnel or relay error.
    #[error(transparent)]
    Tunnel(#[from] otokit_tunnel::TunnelError),

    /// Invalid session configuration.
    #[error("Invalid session: {0}")]
    Session(#[from] otokit_types::Error),

    /// The state machine refused a transition.
    #[error("Illegal state transition {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },
}

impl SyncError {
    /// Whether the run continues after this error.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::Crawl { .. } | Self::Upload { .. })
    }
}
