//! Run events delivered to the single registered listener.

use serde::{Deserialize, Serialize};

/// Status text carried by the finish event of a successful run.
pub const FINISH_STATUS: &str = "传分完成";

// ─────────────────────────────────────────────────────────────────────────────
// Run Event
// ─────────────────────────────────────────────────────────────────────────────

/// One event in the ordered run stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// The tunnel or the run changed status.
    Status {
        status: Option<String>,
        is_running: bool,
    },
    /// Authorization is starting; the user should open `auth_url`.
    StartAuth {
        auth_url: String,
    },
    /// A human-readable progress or log line.
    Progress {
        line: String,
    },
    /// The run completed.
    Finish {
        status: String,
        is_running: bool,
    },
    /// The run failed fatally.
    Error {
        message: String,
    },
}

impl RunEvent {
    pub fn status(status: Option<String>, is_running: bool) -> Self {
        Self::Status { status, is_running }
    }

    pub fn start_auth(auth_url: impl Into<String>) -> Self {
        Self::StartAuth {
            auth_url: auth_url.into(),
        }
    }

    pub fn progress(line: impl Into<String>) -> Self {
        Self::Progress { line: line.into() }
    }

    /// The finish event of a successful run.
    pub fn finish() -> Self {
        Self::Finish {
            status: FINISH_STATUS.to_string(),
            is_running: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Short tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::StartAuth { .. } => "start_auth",
            Self::Progress { .. } => "progress",
            Self::Finish { .. } => "finish",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. } | Self::Error { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Sink
// ─────────────────────────────────────────────────────────────────────────────

/// Producer side of the event stream.
///
/// Implemented by the notification bridge; components that only publish
/// events (tunnel, orchestrator) depend on this trait rather than on the
/// bridge itself.
pub trait EventSink: Send + Sync {
    /// Enqueue an event for delivery.
    fn emit(&self, event: RunEvent);

    /// Update the shared run status and enqueue the matching status event.
    fn set_status(&self, status: Option<String>, running: bool) {
        self.emit(RunEvent::status(status, running));
    }
}

/// Shared handle to an event sink.
pub type SharedEventSink = std::sync::Arc<dyn EventSink>;

// ─────────────────────────────────────────────────────────────────────────────
// Run Status
// ─────────────────────────────────────────────────────────────────────────────

/// The status visible across the notification bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub status: Option<String>,
    pub running: bool,
}

impl RunStatus {
    pub fn new(status: Option<String>, running: bool) -> Self {
        Self { status, running }
    }

    /// The status event describing this snapshot.
    pub fn to_event(&self) -> RunEvent {
        RunEvent::status(self.status.clone(), self.running)
    }
}
