//! Run controller: the `start` / `stop` / `prepare_tunnel` call surface.
//!
//! Owns the current run (tunnel, relay, orchestrator task) and tears it
//! down on `stop` or when a new run starts.

use std::net::SocketAddr;

use otokit_tunnel::{
    FlowRelay, InterceptPolicy, RelayConfig, RelayHandle, TunnelConfig, TunnelError, TunnelHandle,
    TunnelManager,
};
use otokit_types::{RunEvent, SessionConfig, SharedEventSink};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::orchestrator::{Orchestrator, OrchestratorConfig, RunReport};

/// Interception settings. Absent when the run goes without a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptSettings {
    pub tunnel: TunnelConfig,
    pub relay: RelayConfig,
    pub policy: InterceptPolicy,
}

impl InterceptSettings {
    /// The relay's upstream sockets must be pinned to a real interface.
    /// Otherwise they follow the tunnel routes and get redirected back to
    /// the relay.
    pub fn validate(&self) -> std::result::Result<(), TunnelError> {
        match self.relay.bind_device.as_deref() {
            Some(device) if !device.trim().is_empty() => Ok(()),
            _ => Err(TunnelError::NoEgressInterface(
                "set tunnel.bind_device to the interface relayed connections leave through"
                    .to_string(),
            )),
        }
    }

    /// Relay settings bound to the tunnel's relay address and pointed at
    /// the callback listener.
    fn relay_config(&self, callback_addr: SocketAddr) -> RelayConfig {
        self.relay
            .clone()
            .with_listen(SocketAddr::V4(self.tunnel.relay_addr()))
            .with_callback_base(format!("http://{}", callback_addr))
    }
}

/// Everything a controller needs besides the per-run session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerConfig {
    pub intercept: Option<InterceptSettings>,
    pub orchestrator: OrchestratorConfig,
}

struct ActiveRun {
    cancel: CancellationToken,
    task: Option<JoinHandle<RunReport>>,
    tunnel: Option<TunnelHandle>,
    relay: Option<RelayHandle>,
    stopped: bool,
}

impl ActiveRun {
    async fn shutdown(&mut self) {
        if let Some(mut relay) = self.relay.take() {
            relay.stop().await;
        }
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.stop().await;
        }
    }
}

/// Starts and stops runs. At most one run exists per controller.
pub struct SyncController {
    config: ControllerConfig,
    events: SharedEventSink,
    current: Option<ActiveRun>,
}

impl SyncController {
    pub fn new(config: ControllerConfig, events: SharedEventSink) -> Self {
        Self {
            config,
            events,
            current: None,
        }
    }

    /// Whether this process may create the tunnel interface.
    pub fn prepare_tunnel(&self) -> bool {
        otokit_tunnel::device::can_create_device()
    }

    pub fn is_running(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|run| !run.stopped && run.task.as_ref().is_some_and(|t| !t.is_finished()))
    }

    /// Start a run, stopping any previous one first.
    ///
    /// A tunnel preparation failure has already been reported on the event
    /// stream when this returns it; the run never starts.
    pub async fn start(&mut self, session: SessionConfig) -> Result<()> {
        if self.current.is_some() {
            self.stop().await;
            self.current = None;
        }

        session.validate()?;
        if let Some(intercept) = &self.config.intercept
            && let Err(e) = intercept.validate()
        {
            self.events.emit(RunEvent::error(e.to_string()));
            return Err(e.into());
        }
        let session = session.freeze();
        let cancel = CancellationToken::new();

        let mut orchestrator = Orchestrator::new(
            session,
            self.config.orchestrator.clone(),
            self.events.clone(),
            cancel.clone(),
        );

        let (mut tunnel, mut relay) = (None, None);
        if let Some(intercept) = &self.config.intercept {
            let resolved = intercept.policy.resolve().await;
            let manager =
                TunnelManager::new(intercept.tunnel.clone(), resolved, self.events.clone());
            let table = manager.table();
            let mut handle = manager.start()?;

            let relay_config = intercept.relay_config(self.config.orchestrator.callback.bind_addr);
            let (flow_relay, extractions) =
                FlowRelay::new(relay_config, intercept.policy.clone(), table);
            match flow_relay.bind().await {
                Ok(bound) => relay = Some(bound),
                Err(e) => {
                    handle.stop().await;
                    self.events.emit(RunEvent::error(e.to_string()));
                    return Err(e.into());
                }
            }
            orchestrator = orchestrator.with_extractions(extractions);
            tunnel = Some(handle);
        }

        info!(intercept = tunnel.is_some(), "Starting run");
        let task = tokio::spawn(orchestrator.run());
        self.current = Some(ActiveRun {
            cancel,
            task: Some(task),
            tunnel,
            relay,
            stopped: false,
        });
        Ok(())
    }

    /// Stop the current run. Calling it again, or with no run, does nothing.
    pub async fn stop(&mut self) {
        let Some(run) = self.current.as_mut() else {
            return;
        };
        if run.stopped {
            return;
        }
        run.stopped = true;
        run.cancel.cancel();
        run.shutdown().await;
        info!("Run stopped by caller");
        self.events.set_status(None, false);
    }

    /// Wait for the current run to end and tear down its tunnel.
    /// Returns `None` when there is no run to wait for.
    pub async fn wait(&mut self) -> Option<RunReport> {
        let mut run = self.current.take()?;
        let task = run.task.take()?;
        let report = match task.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "Run task ended abnormally");
                None
            }
        };
        run.shutdown().await;
        report
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        if let Some(run) = &self.current {
            run.cancel.cancel();
        }
    }
}
