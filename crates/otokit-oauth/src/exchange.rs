//! Auth URL building and session exchange.
//!
//! The exchange replays the captured callback against the identity
//! provider's origin with a cookie-keeping client. The session is the
//! resulting cookie jar; every later request of the run goes through the
//! same client.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::{CookieStore, Jar};
use tracing::{debug, info};
use url::Url;

use crate::callback::CallbackCode;
use crate::error::{OAuthError, Result};

/// Placeholder in the auth URL replaced with the encoded callback base.
pub const REDIRECT_PLACEHOLDER: &str = "{redirect_uri}";

/// User agent of the in-app browser the identity provider expects.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 13; otokit) AppleWebKit/537.36 \
(KHTML, like Gecko) Version/4.0 Chrome/116.0.0.0 Mobile Safari/537.36 MicroMessenger/8.0.47";

/// HTTP client settings shared by every request of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Build the URL the user is sent to.
///
/// Fails when the configured URL is empty or unparseable.
pub fn build_auth_url(auth_url: &str, callback_base: &str) -> Result<String> {
    if auth_url.trim().is_empty() {
        return Err(OAuthError::Config("wahlap auth url is not configured".to_string()));
    }
    let url = auth_url.replace(
        REDIRECT_PLACEHOLDER,
        &urlencoding::encode(callback_base),
    );
    Url::parse(&url)?;
    Ok(url)
}

/// Cookie jar plus client, before the exchange.
pub struct SessionExchange {
    config: ClientConfig,
    jar: Arc<Jar>,
}

impl SessionExchange {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            jar: Arc::new(Jar::default()),
        }
    }

    /// Add a cookie seen by the relay so the exchange carries it.
    pub fn seed_cookie(&self, host: &str, name: &str, value: &str) {
        match Url::parse(&format!("http://{}/", host)) {
            Ok(url) => {
                self.jar.add_cookie_str(&format!("{}={}", name, value), &url);
                debug!(%host, %name, "Seeded session cookie");
            }
            Err(e) => debug!(%host, error = %e, "Skipping cookie for unparseable host"),
        }
    }

    /// Replay the callback against the origin of `auth_url`.
    pub async fn exchange(self, auth_url: &str, callback: &CallbackCode) -> Result<AuthSession> {
        let base = Url::parse(auth_url)?;
        let target = base.join(&callback.path_and_query())?;

        let client = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&self.jar))
            .timeout(self.config.timeout)
            .user_agent(self.config.user_agent.as_str())
            .build()
            .map_err(|e| OAuthError::Config(format!("Failed to build HTTP client: {}", e)))?;

        info!(host = target.host_str().unwrap_or_default(), path = target.path(), "Exchanging authorization code");
        let response = client
            .get(target.clone())
            .send()
            .await
            .map_err(|e| OAuthError::Network(format!("Session exchange request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(OAuthError::Backend(format!(
                "Session exchange failed ({}): {}",
                status, error_text
            )));
        }

        let session = AuthSession {
            client,
            jar: self.jar,
            origin: base,
        };
        info!(
            cookies = session.cookie_header().is_some(),
            "Session established"
        );
        Ok(session)
    }
}

/// An authenticated session.
#[derive(Clone)]
pub struct AuthSession {
    client: reqwest::Client,
    jar: Arc<Jar>,
    origin: Url,
}

impl AuthSession {
    /// Client carrying the session cookies.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Cookies the jar would send to the identity provider's origin.
    pub fn cookie_header(&self) -> Option<String> {
        self.cookies_for(&self.origin)
    }

    pub fn cookies_for(&self, url: &Url) -> Option<String> {
        self.jar
            .cookies(url)
            .and_then(|v| v.to_str().ok().map(str::to_string))
    }
}
