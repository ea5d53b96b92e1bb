//! Local callback listener.
//!
//! A single-shot axum server that waits for the identity provider's
//! redirect. The first request carrying the code parameter resolves the
//! listener and shuts the server down; requests without it get a 400 and
//! leave the listener armed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, Uri},
    response::{Html, IntoResponse, Response},
};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{OAuthError, Result};

/// Default port the listener binds on loopback.
pub const DEFAULT_CALLBACK_PORT: u16 = 34125;

const CONFIRMATION_PAGE: &str = "<!doctype html><html><head><meta charset=\"utf-8\"><title>otokit</title></head>\
<body><p>授权成功，可以关闭此页面。</p></body></html>";

const MISSING_CODE_PAGE: &str = "<!doctype html><html><head><meta charset=\"utf-8\"><title>otokit</title></head>\
<body><p>缺少授权码。</p></body></html>";

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackConfig {
    pub bind_addr: SocketAddr,
    /// Query parameter carrying the authorization code.
    pub code_param: String,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_CALLBACK_PORT)),
            code_param: "code".to_string(),
        }
    }
}

impl CallbackConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_code_param(mut self, param: impl Into<String>) -> Self {
        self.code_param = param.into();
        self
    }
}

/// The captured redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackCode {
    pub code: String,
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: String,
}

impl CallbackCode {
    /// Build from a request path and query, if the query carries `code_param`.
    pub fn from_parts(path: &str, query: Option<&str>, code_param: &str) -> Option<Self> {
        let query = query.unwrap_or_default();
        let code = url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == code_param)
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())?;

        Some(Self {
            code,
            path: path.to_string(),
            query: query.to_string(),
        })
    }

    /// Build from a full URL, e.g. the location a relayed callback was
    /// bounced to.
    pub fn from_url(url: &str, code_param: &str) -> Option<Self> {
        let url = url::Url::parse(url).ok()?;
        Self::from_parts(url.path(), url.query(), code_param)
    }

    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}

struct CallbackState {
    code_param: String,
    resolver: Mutex<Option<oneshot::Sender<CallbackCode>>>,
    shutdown: CancellationToken,
}

impl CallbackState {
    /// Resolve the listener once; later calls are ignored.
    fn resolve(&self, code: CallbackCode) -> bool {
        let Some(tx) = self.resolver.lock().take() else {
            return false;
        };
        let delivered = tx.send(code).is_ok();
        self.shutdown.cancel();
        delivered
    }
}

/// Resolves a [`CallbackListener`] from outside the HTTP server, e.g. with
/// a code seen by the flow relay.
#[derive(Clone)]
pub struct CallbackInjector {
    state: Arc<CallbackState>,
}

impl CallbackInjector {
    /// Returns `false` if the listener was already resolved.
    pub fn resolve(&self, code: CallbackCode) -> bool {
        self.state.resolve(code)
    }

    /// Resolve from a URL; returns `false` if it carries no code.
    pub fn resolve_url(&self, url: &str) -> bool {
        match CallbackCode::from_url(url, &self.state.code_param) {
            Some(code) => self.resolve(code),
            None => false,
        }
    }
}

/// A bound, armed callback listener.
pub struct CallbackListener {
    local_addr: SocketAddr,
    code_rx: oneshot::Receiver<CallbackCode>,
    state: Arc<CallbackState>,
}

impl CallbackListener {
    /// Bind the endpoint and start serving.
    pub async fn bind(config: CallbackConfig) -> Result<Self> {
        let addr = config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| OAuthError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| OAuthError::Network(e.to_string()))?;

        let (tx, code_rx) = oneshot::channel();
        let shutdown = CancellationToken::new();
        let state = Arc::new(CallbackState {
            code_param: config.code_param,
            resolver: Mutex::new(Some(tx)),
            shutdown: shutdown.clone(),
        });

        let router = Router::new()
            .fallback(handle_callback)
            .with_state(Arc::clone(&state));

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                warn!(error = %e, "Callback server failed");
            }
            debug!("Callback server stopped");
        });

        info!(addr = %local_addr, "Callback listener bound");
        Ok(Self {
            local_addr,
            code_rx,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base URL redirects should be sent to.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn injector(&self) -> CallbackInjector {
        CallbackInjector {
            state: Arc::clone(&self.state),
        }
    }

    /// Wait for the redirect. The server is shut down when this returns.
    pub async fn listen_for_callback(self, timeout: Duration) -> Result<CallbackCode> {
        self.listen_until(timeout, &CancellationToken::new()).await
    }

    /// Like [`listen_for_callback`](Self::listen_for_callback), but gives up
    /// with [`OAuthError::Cancelled`] when `cancel` fires.
    pub async fn listen_until(
        mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CallbackCode> {
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(OAuthError::Cancelled),
            received = tokio::time::timeout(timeout, &mut self.code_rx) => match received {
                Ok(Ok(code)) => Ok(code),
                Ok(Err(_)) => Err(OAuthError::Network("callback server stopped".to_string())),
                Err(_) => Err(OAuthError::Timeout(timeout)),
            },
        };
        self.state.shutdown.cancel();
        result
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
    }
}

async fn handle_callback(State(state): State<Arc<CallbackState>>, uri: Uri) -> Response {
    let Some(code) = CallbackCode::from_parts(uri.path(), uri.query(), &state.code_param) else {
        debug!(path = uri.path(), "Callback request without code");
        return (StatusCode::BAD_REQUEST, Html(MISSING_CODE_PAGE)).into_response();
    };

    let path = code.path.clone();
    if state.resolve(code) {
        info!(%path, "Authorization code received");
    }
    (StatusCode::OK, Html(CONFIRMATION_PAGE)).into_response()
}
