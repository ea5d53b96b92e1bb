//! Shared types for the otokit score sync core.
//!
//! - [`session`]: the immutable per-run [`SessionConfig`]
//! - [`event`]: the tagged [`RunEvent`] stream and [`RunStatus`]
//! - [`score`]: crawled [`ScoreRecord`]s
//! - [`run`]: the [`RunId`] tagging logs and reports

pub mod error;
pub mod event;
pub mod run;
pub mod score;
pub mod session;

pub use error::{Error, Result};
pub use event::{EventSink, FINISH_STATUS, RunEvent, RunStatus, SharedEventSink};
pub use run::RunId;
pub use score::ScoreRecord;
pub use session::{DEFAULT_DIFFICULTIES, SessionConfig, SharedSessionConfig};
