//! Run state machine.

use std::fmt;

/// Where a run is.
///
/// ```text
/// Idle -> StartingAuth -> AwaitingCallback -> ExchangingSession -> Authenticated
///      -> Crawling -> Uploading -> Done
/// any auth/crawl stage -> Failed
/// any non-terminal state -> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RunState {
    #[default]
    Idle,
    StartingAuth,
    AwaitingCallback,
    ExchangingSession,
    Authenticated,
    Crawling,
    Uploading,
    Done,
    Failed,
    Stopped,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Stopped)
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;

        if self.is_terminal() {
            return false;
        }
        match next {
            Stopped => true,
            Failed => self != Idle,
            StartingAuth => self == Idle,
            AwaitingCallback => self == StartingAuth,
            ExchangingSession => self == AwaitingCallback,
            Authenticated => self == ExchangingSession,
            Crawling => self == Authenticated,
            Uploading => self == Crawling,
            Done => self == Uploading,
            Idle => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::StartingAuth => "starting_auth",
            Self::AwaitingCallback => "awaiting_callback",
            Self::ExchangingSession => "exchanging_session",
            Self::Authenticated => "authenticated",
            Self::Crawling => "crawling",
            Self::Uploading => "uploading",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
