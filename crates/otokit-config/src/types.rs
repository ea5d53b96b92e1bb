//! Configuration types.
//!
//! The file layout uses snake_case keys. [`SessionSection`] converts into
//! the camelCase [`SessionConfig`] intake type; the remaining sections
//! convert into a [`ControllerConfig`].

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use otokit_oauth::{CallbackConfig, ClientConfig};
use otokit_sync::{ControllerConfig, InterceptSettings, OrchestratorConfig};
use otokit_tunnel::{InterceptPolicy, RedirectRule, RelayConfig, TunnelConfig};
use otokit_types::SessionConfig;
use otokit_types::session::DEFAULT_DIFFICULTIES;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Root Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// Absent sections fall back to built-in defaults. When layers are merged a
/// present section replaces the lower layer's section wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtokitConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionSection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelSection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackSection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSection>,
}

impl OtokitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: OtokitConfig) {
        if other.session.is_some() {
            self.session = other.session;
        }
        if other.tunnel.is_some() {
            self.tunnel = other.tunnel;
        }
        if other.callback.is_some() {
            self.callback = other.callback;
        }
        if other.http.is_some() {
            self.http = other.http;
        }
    }

    /// Build the per-run session from `[session]`.
    pub fn session_config(&self) -> Result<SessionConfig> {
        self.session.clone().unwrap_or_default().into_session()
    }

    /// Build the controller settings from `[tunnel]`, `[callback]` and `[http]`.
    pub fn controller_config(&self) -> ControllerConfig {
        let callback = self.callback.clone().unwrap_or_default();
        let http = self.http.clone().unwrap_or_default();

        let orchestrator = OrchestratorConfig {
            callback: CallbackConfig::new(callback.bind).with_code_param(callback.code_param),
            callback_timeout: Duration::from_secs(callback.timeout_secs),
            client: http.client_config(),
        };

        let intercept = self
            .tunnel
            .as_ref()
            .filter(|t| t.enabled)
            .map(TunnelSection::intercept_settings);

        ControllerConfig {
            intercept,
            orchestrator,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// `[session]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub username: String,
    /// Stored in plaintext; loading warns when set.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    pub lxns_upload_url: String,
    pub df_upload_url: String,
    pub wahlap_auth_url: String,
    pub game_type: i32,
    pub difficulties: Vec<i32>,
    pub genre_list: Vec<String>,
    /// Difficulty → fetch URL template. TOML keys are strings.
    pub fetch_url_map: BTreeMap<String, String>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            lxns_upload_url: String::new(),
            df_upload_url: String::new(),
            wahlap_auth_url: String::new(),
            game_type: 0,
            difficulties: DEFAULT_DIFFICULTIES.to_vec(),
            genre_list: Vec::new(),
            fetch_url_map: BTreeMap::new(),
        }
    }
}

impl SessionSection {
    pub fn has_plaintext_password(&self) -> bool {
        !self.password.is_empty()
    }

    /// Convert into the intake type. Fails on a non-numeric
    /// `fetch_url_map` key.
    pub fn into_session(self) -> Result<SessionConfig> {
        let mut session = SessionConfig::new(self.username, self.password)
            .with_lxns_upload_url(self.lxns_upload_url)
            .with_df_upload_url(self.df_upload_url)
            .with_auth_url(self.wahlap_auth_url)
            .with_game_type(self.game_type)
            .with_difficulties(self.difficulties)
            .with_genres(self.genre_list);

        for (key, template) in self.fetch_url_map {
            let difficulty = key.trim().parse::<i32>().map_err(|e| ConfigError::Invalid {
                field: format!("session.fetch_url_map.{}", key),
                message: e.to_string(),
            })?;
            session = session.with_fetch_url(difficulty, template);
        }
        Ok(session)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tunnel
// ─────────────────────────────────────────────────────────────────────────────

/// `[tunnel]` section.
///
/// Host lists left unset keep the built-in interception policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSection {
    /// Route traffic through the tunnel and relay during a run.
    pub enabled: bool,
    pub address: Ipv4Addr,
    pub prefix: u8,
    pub mtu: u16,
    pub relay_port: u16,
    pub idle_timeout_secs: u64,
    /// Interface upstream relay sockets are bound to. Required when
    /// `enabled` is set (Linux and macOS).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_hosts: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inspect_hosts: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<Vec<RedirectSection>>,
    /// Headers added to inspected requests.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl Default for TunnelSection {
    fn default() -> Self {
        let tunnel = TunnelConfig::default();
        Self {
            enabled: false,
            address: tunnel.address,
            prefix: tunnel.prefix,
            mtu: tunnel.mtu,
            relay_port: tunnel.relay_port,
            idle_timeout_secs: tunnel.idle_timeout.as_secs(),
            bind_device: None,
            allow_hosts: None,
            inspect_hosts: None,
            redirect: None,
            headers: BTreeMap::new(),
        }
    }
}

/// One `[[tunnel.redirect]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectSection {
    pub host: String,
    pub path_prefix: String,
}

impl TunnelSection {
    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            address: self.address,
            prefix: self.prefix,
            mtu: self.mtu,
            relay_port: self.relay_port,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            ..Default::default()
        }
    }

    pub fn policy(&self) -> InterceptPolicy {
        let mut policy = InterceptPolicy::default();
        if let Some(hosts) = &self.allow_hosts {
            policy.allow_hosts = hosts.clone();
        }
        if let Some(hosts) = &self.inspect_hosts {
            policy.inspect_hosts = hosts.clone();
        }
        if let Some(rules) = &self.redirect {
            policy.redirect_rules = rules
                .iter()
                .map(|r| RedirectRule::new(&r.host, &r.path_prefix))
                .collect();
        }
        for (name, value) in &self.headers {
            policy = policy.with_header(name, value);
        }
        policy
    }

    /// Tunnel, relay and policy settings, regardless of `enabled`.
    pub fn intercept_settings(&self) -> InterceptSettings {
        let tunnel = self.tunnel_config();
        let mut relay =
            RelayConfig::default().with_idle_timeout(Duration::from_secs(self.idle_timeout_secs));
        if let Some(device) = &self.bind_device {
            relay = relay.with_bind_device(device);
        }
        InterceptSettings {
            tunnel,
            relay,
            policy: self.policy(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Callback / HTTP
// ─────────────────────────────────────────────────────────────────────────────

/// `[callback]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackSection {
    pub bind: SocketAddr,
    pub code_param: String,
    /// How long a run waits for the redirect.
    pub timeout_secs: u64,
}

impl Default for CallbackSection {
    fn default() -> Self {
        let callback = CallbackConfig::default();
        Self {
            bind: callback.bind_addr,
            code_param: callback.code_param,
            timeout_secs: OrchestratorConfig::default().callback_timeout.as_secs(),
        }
    }
}

/// `[http]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            timeout_secs: ClientConfig::default().timeout.as_secs(),
            user_agent: None,
        }
    }
}

impl HttpSection {
    pub fn client_config(&self) -> ClientConfig {
        let mut client = ClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            ..Default::default()
        };
        if let Some(ua) = &self.user_agent {
            client.user_agent = ua.clone();
        }
        client
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
