//! Run orchestration for otokit.
//!
//! # Components
//!
//! - [`bridge`]: single-listener ordered event delivery
//! - [`state`]: the run state machine
//! - [`crawl`] / [`upload`]: the per-pair fetch and per-endpoint upload steps
//! - [`orchestrator`]: drives one run from authorization to finish
//! - [`controller`]: `start` / `stop` / `prepare_tunnel`

pub mod bridge;
pub mod controller;
pub mod crawl;
pub mod error;
pub mod orchestrator;
pub mod state;
pub mod upload;

pub use bridge::{EventListener, NotificationBridge};
pub use controller::{ControllerConfig, InterceptSettings, SyncController};
pub use error::{Result, SyncError};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunReport};
pub use state::RunState;
