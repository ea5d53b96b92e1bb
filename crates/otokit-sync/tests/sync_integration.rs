//! End-to-end runs against a mock vendor backend.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use otokit_oauth::{CallbackConfig, ClientConfig};
use otokit_sync::{
    ControllerConfig, InterceptSettings, NotificationBridge, Orchestrator, OrchestratorConfig,
    RunReport, RunState, SyncController, SyncError,
};
use otokit_tunnel::{InterceptPolicy, RelayConfig, TunnelConfig, TunnelError};
use otokit_types::{EventSink, RunEvent, SessionConfig};

// ─────────────────────────────────────────────────────────────────────────────
// Mock vendor
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct VendorState {
    fail_exchange: bool,
    fail_diffs: Vec<i32>,
    /// Cancel this token while the session exchange is in flight, then
    /// reject the exchange.
    cancel_in_exchange: Option<CancellationToken>,
    /// Cancel this token while the first upload is in flight.
    cancel_in_upload: Option<CancellationToken>,
    /// Cancel this token when the n-th fetch arrives.
    cancel_at: Option<(usize, CancellationToken)>,
    fetches: AtomicUsize,
    uploads: Mutex<Vec<(String, usize)>>,
}

async fn handle_callback(
    State(state): State<Arc<VendorState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if let Some(token) = &state.cancel_in_exchange {
        token.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        return (StatusCode::INTERNAL_SERVER_ERROR, "torn down").into_response();
    }
    if state.fail_exchange || params.get("code").is_none() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "exchange rejected").into_response();
    }
    (
        StatusCode::OK,
        [(header::SET_COOKIE, "_t=session; Path=/")],
        "ok",
    )
        .into_response()
}

async fn handle_record(
    State(state): State<Arc<VendorState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let n = state.fetches.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some((at, token)) = &state.cancel_at
        && n == *at
    {
        token.cancel();
    }

    let diff: i32 = params.get("diff").and_then(|d| d.parse().ok()).unwrap_or(-1);
    if state.fail_diffs.contains(&diff) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
    }
    Json(serde_json::json!([
        { "title": format!("song-{}", diff), "achievement": 100.5 }
    ]))
    .into_response()
}

async fn handle_upload(
    State(state): State<Arc<VendorState>>,
    Path(name): Path<String>,
    Json(records): Json<Vec<serde_json::Value>>,
) -> impl IntoResponse {
    state.uploads.lock().push((name, records.len()));
    if let Some(token) = &state.cancel_in_upload {
        token.cancel();
    }
    StatusCode::OK
}

async fn start_vendor(state: Arc<VendorState>) -> Result<SocketAddr> {
    let router = Router::new()
        .route("/wc_auth/oauth/callback/maimai-dx", get(handle_callback))
        .route("/record", get(handle_record))
        .route("/upload/{name}", post(handle_upload))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    Ok(addr)
}

fn session(vendor: SocketAddr, difficulties: &[i32]) -> SessionConfig {
    let mut session = SessionConfig::new("player", "secret")
        .with_auth_url(format!(
            "http://{}/wc_auth/oauth/authorize/maimai-dx?redirect={{redirect_uri}}",
            vendor
        ))
        .with_difficulties(difficulties.iter().copied())
        .with_genres(["maimai"])
        .with_lxns_upload_url(format!("http://{}/upload/lxns", vendor))
        .with_df_upload_url(format!("http://{}/upload/df", vendor));
    for &diff in difficulties {
        session = session.with_fetch_url(
            diff,
            format!("http://{}/record?diff={{diff}}&genre={{genre}}", vendor),
        );
    }
    session
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

/// Play the browser: follow the auth URL's redirect target to the callback
/// listener with a code.
async fn complete_auth(auth_url: String) {
    let Ok(url) = url::Url::parse(&auth_url) else {
        return;
    };
    let Some(base) = url
        .query_pairs()
        .find(|(k, _)| k == "redirect")
        .map(|(_, v)| v.into_owned())
    else {
        return;
    };
    let client = reqwest::Client::builder().no_proxy().build();
    if let Ok(client) = client {
        let _ = client
            .get(format!("{}/wc_auth/oauth/callback/maimai-dx?r=c&code=abc", base))
            .send()
            .await;
    }
}

fn orchestrator_config(callback_timeout: Duration) -> OrchestratorConfig {
    OrchestratorConfig {
        callback: CallbackConfig::new("127.0.0.1:0".parse().unwrap()),
        callback_timeout,
        client: ClientConfig::default(),
    }
}

fn browsing_listener(bridge: &NotificationBridge, browse: bool) -> mpsc::UnboundedReceiver<RunEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    bridge.set_listener(move |event: &RunEvent| {
        if browse && let RunEvent::StartAuth { auth_url } = event {
            tokio::spawn(complete_auth(auth_url.clone()));
        }
        let _ = tx.send(event.clone());
    });
    rx
}

async fn run(
    session: SessionConfig,
    cancel: CancellationToken,
    browse: bool,
    callback_timeout: Duration,
) -> Result<(RunReport, Vec<RunEvent>)> {
    let bridge = NotificationBridge::new();
    let mut rx = browsing_listener(&bridge, browse);

    let orchestrator = Orchestrator::new(
        session.freeze(),
        orchestrator_config(callback_timeout),
        bridge.sink(),
        cancel,
    );
    let report = tokio::time::timeout(Duration::from_secs(20), orchestrator.run()).await?;
    bridge.flush().await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    Ok((report, events))
}

fn kinds(events: &[RunEvent]) -> Vec<&'static str> {
    events.iter().map(RunEvent::kind).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_successful_run() -> Result<()> {
    let vendor = Arc::new(VendorState::default());
    let addr = start_vendor(Arc::clone(&vendor)).await?;

    let (report, events) = run(
        session(addr, &[0, 1]),
        CancellationToken::new(),
        true,
        Duration::from_secs(5),
    )
    .await?;

    assert_eq!(kinds(&events), vec!["start_auth", "progress", "progress", "finish"]);
    assert_eq!(events[3], RunEvent::finish());
    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.records_uploaded, 2);
    assert!(report.finished_at.is_some_and(|end| end >= report.started_at));
    assert_eq!(
        *vendor.uploads.lock(),
        vec![("lxns".to_string(), 2), ("df".to_string(), 2)]
    );
    Ok(())
}

#[tokio::test]
async fn test_failed_exchange_emits_one_error() -> Result<()> {
    let vendor = Arc::new(VendorState {
        fail_exchange: true,
        ..Default::default()
    });
    let addr = start_vendor(Arc::clone(&vendor)).await?;

    let (report, events) = run(
        session(addr, &[0, 1]),
        CancellationToken::new(),
        true,
        Duration::from_secs(5),
    )
    .await?;

    assert_eq!(events[0].kind(), "start_auth");
    assert_eq!(kinds(&events).iter().filter(|k| **k == "error").count(), 1);
    assert!(!kinds(&events).contains(&"progress"));
    assert!(!kinds(&events).contains(&"finish"));
    assert_eq!(report.state, RunState::Failed);
    assert_eq!(vendor.fetches.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_failing_pairs_are_skipped_and_summarized() -> Result<()> {
    let vendor = Arc::new(VendorState {
        fail_diffs: vec![1, 3],
        ..Default::default()
    });
    let addr = start_vendor(Arc::clone(&vendor)).await?;

    let (report, events) = run(
        session(addr, &[0, 1, 2, 3]),
        CancellationToken::new(),
        true,
        Duration::from_secs(5),
    )
    .await?;

    assert!(!kinds(&events).contains(&"error"));
    let summaries: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, RunEvent::Progress { line } if line.starts_with("[SUMMARY]")))
        .collect();
    assert_eq!(summaries.len(), 1);
    assert_eq!(events.last(), Some(&RunEvent::finish()));

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.skipped_pairs.len(), 2);
    assert_eq!(report.records_uploaded, 2);
    assert_eq!(
        *vendor.uploads.lock(),
        vec![("lxns".to_string(), 2), ("df".to_string(), 2)]
    );
    Ok(())
}

#[tokio::test]
async fn test_stop_before_pair_prevents_further_fetches() -> Result<()> {
    let cancel = CancellationToken::new();
    let vendor = Arc::new(VendorState {
        cancel_at: Some((2, cancel.clone())),
        ..Default::default()
    });
    let addr = start_vendor(Arc::clone(&vendor)).await?;

    let (report, events) = run(
        session(addr, &[0, 1, 2, 3, 4]),
        cancel,
        true,
        Duration::from_secs(5),
    )
    .await?;

    assert_eq!(report.state, RunState::Stopped);
    assert_eq!(vendor.fetches.load(Ordering::SeqCst), 2);
    assert!(vendor.uploads.lock().is_empty());
    assert!(!kinds(&events).contains(&"finish"));
    assert!(!kinds(&events).contains(&"error"));
    Ok(())
}

#[tokio::test]
async fn test_stop_during_exchange_ends_stopped_without_error() -> Result<()> {
    let cancel = CancellationToken::new();
    let vendor = Arc::new(VendorState {
        cancel_in_exchange: Some(cancel.clone()),
        ..Default::default()
    });
    let addr = start_vendor(Arc::clone(&vendor)).await?;

    let (report, events) = run(session(addr, &[0, 1]), cancel, true, Duration::from_secs(5)).await?;

    assert_eq!(report.state, RunState::Stopped);
    assert_eq!(kinds(&events), vec!["start_auth"]);
    assert_eq!(vendor.fetches.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_stop_during_upload_skips_finish() -> Result<()> {
    let cancel = CancellationToken::new();
    let vendor = Arc::new(VendorState {
        cancel_in_upload: Some(cancel.clone()),
        ..Default::default()
    });
    let addr = start_vendor(Arc::clone(&vendor)).await?;

    let (report, events) = run(session(addr, &[0]), cancel, true, Duration::from_secs(5)).await?;

    assert_eq!(report.state, RunState::Stopped);
    assert_eq!(*vendor.uploads.lock(), vec![("lxns".to_string(), 1)]);
    assert_eq!(kinds(&events), vec!["start_auth", "progress"]);
    assert!(!kinds(&events).contains(&"finish"));
    assert!(!kinds(&events).contains(&"error"));
    Ok(())
}

#[tokio::test]
async fn test_auth_timeout() -> Result<()> {
    let vendor = Arc::new(VendorState::default());
    let addr = start_vendor(vendor).await?;

    let (report, events) = run(
        session(addr, &[0]),
        CancellationToken::new(),
        false,
        Duration::from_millis(200),
    )
    .await?;

    assert_eq!(report.state, RunState::Failed);
    assert!(events.contains(&RunEvent::error("auth timeout")));
    Ok(())
}

#[tokio::test]
async fn test_replaced_listener_receives_nothing_further() -> Result<()> {
    let bridge = NotificationBridge::new();
    let (first_tx, mut first) = mpsc::unbounded_channel();
    let (second_tx, mut second) = mpsc::unbounded_channel();

    bridge.set_listener(first_tx);
    bridge.sink().emit(RunEvent::progress("a"));
    bridge.flush().await;

    bridge.set_listener(second_tx);
    bridge.sink().emit(RunEvent::progress("b"));
    bridge.sink().emit(RunEvent::finish());
    bridge.flush().await;

    assert_eq!(first.try_recv()?, RunEvent::progress("a"));
    assert!(first.try_recv().is_err());
    assert_eq!(second.try_recv()?, RunEvent::progress("b"));
    assert_eq!(second.try_recv()?, RunEvent::finish());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Controller
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_controller_stop_is_idempotent() -> Result<()> {
    let vendor = Arc::new(VendorState::default());
    let addr = start_vendor(vendor).await?;

    let bridge = NotificationBridge::new();
    let mut rx = browsing_listener(&bridge, false);
    let config = ControllerConfig {
        intercept: None,
        orchestrator: orchestrator_config(Duration::from_secs(30)),
    };
    let mut controller = SyncController::new(config, bridge.sink());

    controller.start(session(addr, &[0])).await?;
    assert!(controller.is_running());
    controller.stop().await;
    controller.stop().await;

    let report = controller.wait().await;
    assert_eq!(report.map(|r| r.state), Some(RunState::Stopped));

    bridge.flush().await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let cleared = events
        .iter()
        .filter(|e| **e == RunEvent::status(None, false))
        .count();
    assert_eq!(cleared, 1);
    assert!(!kinds(&events).contains(&"error"));
    assert!(!kinds(&events).contains(&"finish"));
    Ok(())
}

#[tokio::test]
async fn test_controller_rejects_intercept_without_egress_interface() -> Result<()> {
    let vendor = Arc::new(VendorState::default());
    let addr = start_vendor(vendor).await?;

    let bridge = NotificationBridge::new();
    let mut rx = browsing_listener(&bridge, false);
    let config = ControllerConfig {
        intercept: Some(InterceptSettings {
            tunnel: TunnelConfig::default(),
            relay: RelayConfig::default(),
            policy: InterceptPolicy::default(),
        }),
        orchestrator: orchestrator_config(Duration::from_secs(30)),
    };
    let mut controller = SyncController::new(config, bridge.sink());

    let result = controller.start(session(addr, &[0])).await;
    assert!(matches!(
        result,
        Err(SyncError::Tunnel(TunnelError::NoEgressInterface(_)))
    ));
    assert!(!controller.is_running());

    bridge.flush().await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(kinds(&events), vec!["error"]);
    Ok(())
}

#[tokio::test]
async fn test_controller_rejects_invalid_session() -> Result<()> {
    let bridge = NotificationBridge::new();
    let mut controller = SyncController::new(ControllerConfig::default(), bridge.sink());

    let result = controller.start(SessionConfig::new("player", "secret")).await;
    assert!(matches!(result, Err(SyncError::Session(_))));
    assert!(!controller.is_running());
    assert!(controller.wait().await.is_none());
    Ok(())
}
