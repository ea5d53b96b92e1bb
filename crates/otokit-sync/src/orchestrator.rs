//! Auth/crawl orchestrator.
//!
//! Drives one run through the [`RunState`] machine: start the
//! identity-provider flow, wait for the callback, exchange it for a session,
//! crawl every (difficulty, genre) pair, upload, finish. The stop token is
//! checked on entry to every state and around every network call. Once it
//! is set the run ends `Stopped` without emitting an error or a finish.

use std::time::Duration;

use otokit_oauth::{
    CallbackConfig, CallbackInjector, CallbackListener, ClientConfig, OAuthError, SessionExchange,
    build_auth_url,
};
use otokit_tunnel::Extraction;
use chrono::{DateTime, Utc};
use otokit_types::{RunEvent, RunId, ScoreRecord, SharedEventSink, SharedSessionConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crawl;
use crate::error::SyncError;
use crate::state::RunState;
use crate::upload;

/// Auth and HTTP settings of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub callback: CallbackConfig,
    /// How long to wait for the identity-provider redirect.
    pub callback_timeout: Duration,
    pub client: ClientConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            callback: CallbackConfig::default(),
            callback_timeout: Duration::from_secs(300),
            client: ClientConfig::default(),
        }
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub run_id: RunId,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    /// Set once the run reaches a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    pub pairs_total: usize,
    /// Records accepted by at least one endpoint.
    pub records_uploaded: usize,
    pub skipped_pairs: Vec<(i32, Option<String>)>,
    pub uploaded_endpoints: Vec<String>,
    pub failed_endpoints: Vec<String>,
}

impl RunReport {
    /// The aggregated summary line, if anything was skipped.
    pub fn summary_line(&self) -> Option<String> {
        if self.skipped_pairs.is_empty() && self.failed_endpoints.is_empty() {
            return None;
        }
        let pairs: Vec<String> = self
            .skipped_pairs
            .iter()
            .map(|(diff, genre)| match genre {
                Some(genre) => format!("{}/{}", diff, genre),
                None => diff.to_string(),
            })
            .collect();
        Some(format!(
            "[SUMMARY] 跳过 {} 个分类 [{}]，上传失败 {} 个 [{}]",
            pairs.len(),
            pairs.join(", "),
            self.failed_endpoints.len(),
            self.failed_endpoints.join(", ")
        ))
    }
}

/// Why the run left the happy path.
enum Halt {
    Stopped,
    Failed(SyncError),
}

impl From<SyncError> for Halt {
    fn from(e: SyncError) -> Self {
        Halt::Failed(e)
    }
}

type Step<T> = std::result::Result<T, Halt>;

/// One run. Consumed by [`run`](Orchestrator::run).
pub struct Orchestrator {
    run_id: RunId,
    session: SharedSessionConfig,
    config: OrchestratorConfig,
    events: SharedEventSink,
    cancel: CancellationToken,
    extractions: Option<mpsc::UnboundedReceiver<Extraction>>,
    state: RunState,
}

impl Orchestrator {
    pub fn new(
        session: SharedSessionConfig,
        config: OrchestratorConfig,
        events: SharedEventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id: RunId::new(),
            session,
            config,
            events,
            cancel,
            extractions: None,
            state: RunState::Idle,
        }
    }

    /// Consume cookies and callback redirects observed by the flow relay.
    pub fn with_extractions(mut self, rx: mpsc::UnboundedReceiver<Extraction>) -> Self {
        self.extractions = Some(rx);
        self
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Drive the run to a terminal state.
    pub async fn run(mut self) -> RunReport {
        let mut report = RunReport {
            run_id: self.run_id,
            started_at: Utc::now(),
            pairs_total: self.session.crawl_pairs().len(),
            ..Default::default()
        };

        match self.drive(&mut report).await {
            Ok(()) => {}
            Err(Halt::Stopped) => {
                self.force(RunState::Stopped);
                info!(run_id = %self.run_id, "Run stopped");
            }
            Err(Halt::Failed(e)) if self.cancel.is_cancelled() => {
                // Teardown after stop breaks in-flight requests; not a failure.
                self.force(RunState::Stopped);
                info!(run_id = %self.run_id, error = %e, "Run stopped");
            }
            Err(Halt::Failed(e)) => {
                self.force(RunState::Failed);
                error!(run_id = %self.run_id, error = %e, "Run failed");
                self.events.emit(RunEvent::error(e.to_string()));
                self.events.set_status(None, false);
            }
        }

        report.state = self.state;
        report.finished_at = Some(Utc::now());
        report
    }

    async fn drive(&mut self, report: &mut RunReport) -> Step<()> {
        // ── Auth ────────────────────────────────────────────────────────────
        self.advance(RunState::StartingAuth)?;
        let listener = CallbackListener::bind(self.config.callback.clone())
            .await
            .map_err(SyncError::from)?;
        let auth_url = build_auth_url(&self.session.wahlap_auth_url, &listener.base_url())
            .map_err(|e| SyncError::AuthExchange(e.to_string()))?;
        info!(run_id = %self.run_id, %auth_url, "Starting authorization");
        self.events.emit(RunEvent::start_auth(auth_url));

        self.advance(RunState::AwaitingCallback)?;
        let exchange = SessionExchange::new(self.config.client.clone());
        let injector = listener.injector();
        let code = {
            let waiting = listener.listen_until(self.config.callback_timeout, &self.cancel);
            tokio::pin!(waiting);
            loop {
                tokio::select! {
                    result = &mut waiting => break result,
                    Some(extraction) = next_extraction(&mut self.extractions) => {
                        apply_extraction(extraction, &exchange, &injector);
                    }
                }
            }
        };
        let code = match code {
            Ok(code) => code,
            Err(OAuthError::Cancelled) => return Err(Halt::Stopped),
            Err(e) => return Err(SyncError::from(e).into()),
        };
        if let Some(rx) = self.extractions.as_mut() {
            while let Ok(extraction) = rx.try_recv() {
                apply_extraction(extraction, &exchange, &injector);
            }
        }

        self.advance(RunState::ExchangingSession)?;
        let auth = exchange
            .exchange(&self.session.wahlap_auth_url, &code)
            .await
            .map_err(|e| SyncError::AuthExchange(e.to_string()))?;
        self.advance(RunState::Authenticated)?;

        // ── Crawl ───────────────────────────────────────────────────────────
        self.advance(RunState::Crawling)?;
        let mut records: Vec<ScoreRecord> = Vec::new();
        for (difficulty, genre) in self.session.crawl_pairs() {
            self.checkpoint()?;
            let fetched =
                crawl::fetch_pair(auth.client(), &self.session, difficulty, genre.as_deref()).await;
            self.checkpoint()?;
            match fetched {
                Ok(fetched) => {
                    info!(difficulty, genre = genre.as_deref(), records = fetched.len(), "Pair crawled");
                    self.events.emit(RunEvent::progress(format!(
                        "[CRAWL] 难度 {} {}：获取 {} 条成绩",
                        difficulty,
                        genre.as_deref().unwrap_or("全部"),
                        fetched.len()
                    )));
                    records.extend(fetched);
                }
                Err(e) => {
                    warn!(error = %e, "Skipping pair");
                    report.skipped_pairs.push((difficulty, genre));
                }
            }
        }

        // ── Upload ──────────────────────────────────────────────────────────
        self.advance(RunState::Uploading)?;
        let uploader = reqwest::Client::builder()
            .timeout(self.config.client.timeout)
            .build()
            .map_err(|e| SyncError::Upload {
                endpoint: "*".to_string(),
                message: e.to_string(),
            })?;
        for (endpoint, url) in self.session.upload_endpoints() {
            self.checkpoint()?;
            let uploaded = upload::upload_records(&uploader, endpoint, url, &records).await;
            self.checkpoint()?;
            match uploaded {
                Ok(()) => report.uploaded_endpoints.push(endpoint.to_string()),
                Err(e) => {
                    warn!(error = %e, "Skipping endpoint");
                    report.failed_endpoints.push(endpoint.to_string());
                }
            }
        }
        if !report.uploaded_endpoints.is_empty() {
            report.records_uploaded = records.len();
        }

        if let Some(line) = report.summary_line() {
            self.events.emit(RunEvent::progress(line));
        }

        self.advance(RunState::Done)?;
        info!(
            run_id = %self.run_id,
            records = records.len(),
            skipped = report.skipped_pairs.len(),
            failed_endpoints = report.failed_endpoints.len(),
            "Run finished"
        );
        self.events.emit(RunEvent::finish());
        Ok(())
    }

    fn checkpoint(&self) -> Step<()> {
        if self.cancel.is_cancelled() {
            Err(Halt::Stopped)
        } else {
            Ok(())
        }
    }

    /// Checkpoint, then move to `next` if the transition is legal.
    fn advance(&mut self, next: RunState) -> Step<()> {
        self.checkpoint()?;
        if !self.state.can_transition_to(next) {
            return Err(SyncError::InvalidTransition {
                from: self.state,
                to: next,
            }
            .into());
        }
        debug!(from = %self.state, to = %next, "State transition");
        self.state = next;
        Ok(())
    }

    /// Enter a terminal state after leaving the happy path.
    fn force(&mut self, next: RunState) {
        if self.state.can_transition_to(next) {
            debug!(from = %self.state, to = %next, "State transition");
            self.state = next;
        }
    }
}

async fn next_extraction(rx: &mut Option<mpsc::UnboundedReceiver<Extraction>>) -> Option<Extraction> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn apply_extraction(extraction: Extraction, exchange: &SessionExchange, injector: &CallbackInjector) {
    match extraction {
        Extraction::Cookie { host, name, value } => exchange.seed_cookie(&host, &name, &value),
        Extraction::AuthRedirect { url } => {
            if injector.resolve_url(&url) {
                debug!("Callback resolved from relayed redirect");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_line() {
        let mut report = RunReport::default();
        assert!(report.summary_line().is_none());

        report.skipped_pairs.push((2, Some("maimai".to_string())));
        report.skipped_pairs.push((10, None));
        report.failed_endpoints.push("lxns".to_string());
        let line = report.summary_line().unwrap();
        assert!(line.starts_with("[SUMMARY]"));
        assert!(line.contains("2/maimai, 10"));
        assert!(line.contains("lxns"));
    }

    #[test]
    fn test_orchestrator_config_default() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.callback_timeout, Duration::from_secs(300));
        assert_eq!(config.callback.code_param, "code");
    }
}
