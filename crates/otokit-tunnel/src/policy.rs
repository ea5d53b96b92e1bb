//! Interception policy.
//!
//! Which destinations are redirected into the relay, which of those get
//! their HTTP heads inspected, and which requests are bounced to the local
//! callback listener. Hosts are matched exactly or by `*.suffix` wildcard.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use tracing::{debug, info, warn};

/// Identity-provider host that receives the OAuth callback.
pub const WAHLAP_AUTH_HOST: &str = "tgk-wcaime.wahlap.com";

/// Path prefix of the identity-provider callback.
pub const WAHLAP_CALLBACK_PREFIX: &str = "/wc_auth/oauth/callback/";

/// A request that is answered with a redirect to the local callback
/// listener instead of being forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRule {
    pub host: String,
    pub path_prefix: String,
}

impl RedirectRule {
    pub fn new(host: impl Into<String>, path_prefix: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path_prefix: path_prefix.into(),
        }
    }

    pub fn matches(&self, host: &str, path: &str) -> bool {
        host_matches(&self.host, host) && path.starts_with(&self.path_prefix)
    }
}

/// Configurable interception policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptPolicy {
    /// Hosts (or literal IPv4 addresses) whose TCP flows are redirected.
    pub allow_hosts: Vec<String>,
    /// Hosts whose plaintext HTTP heads are inspected and rewritten.
    pub inspect_hosts: Vec<String>,
    pub redirect_rules: Vec<RedirectRule>,
    /// Headers added to inspected requests (replacing existing values).
    pub inject_headers: Vec<(String, String)>,
}

impl Default for InterceptPolicy {
    fn default() -> Self {
        Self {
            allow_hosts: vec![
                WAHLAP_AUTH_HOST.to_string(),
                "maimai.wahlap.com".to_string(),
                "chunithm.wahlap.com".to_string(),
            ],
            inspect_hosts: vec![WAHLAP_AUTH_HOST.to_string()],
            redirect_rules: vec![RedirectRule::new(WAHLAP_AUTH_HOST, WAHLAP_CALLBACK_PREFIX)],
            inject_headers: Vec::new(),
        }
    }
}

impl InterceptPolicy {
    /// An empty policy that intercepts nothing.
    pub fn empty() -> Self {
        Self {
            allow_hosts: Vec::new(),
            inspect_hosts: Vec::new(),
            redirect_rules: Vec::new(),
            inject_headers: Vec::new(),
        }
    }

    pub fn with_allow_host(mut self, host: impl Into<String>) -> Self {
        self.allow_hosts.push(host.into());
        self
    }

    pub fn with_inspect_host(mut self, host: impl Into<String>) -> Self {
        self.inspect_hosts.push(host.into());
        self
    }

    pub fn with_redirect(mut self, rule: RedirectRule) -> Self {
        self.redirect_rules.push(rule);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inject_headers.push((name.into(), value.into()));
        self
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        self.allow_hosts.iter().any(|p| host_matches(p, host))
    }

    pub fn is_inspected(&self, host: &str) -> bool {
        self.inspect_hosts.iter().any(|p| host_matches(p, host))
    }

    pub fn redirect_for(&self, host: &str, path: &str) -> Option<&RedirectRule> {
        self.redirect_rules.iter().find(|r| r.matches(host, path))
    }

    /// Resolve the allowlist to IPv4 addresses.
    ///
    /// Literal addresses are taken as-is, names go through the system
    /// resolver. Wildcards cannot be resolved and only take part in
    /// host-header matching. Resolution failures are logged and skipped.
    pub async fn resolve(&self) -> ResolvedPolicy {
        let mut by_ip = HashMap::new();

        for host in &self.allow_hosts {
            if host.starts_with("*.") {
                continue;
            }
            if let Ok(ip) = host.parse::<Ipv4Addr>() {
                by_ip.insert(ip, host.clone());
                continue;
            }
            match tokio::net::lookup_host((host.as_str(), 80)).await {
                Ok(addrs) => {
                    for addr in addrs {
                        if let IpAddr::V4(ip) = addr.ip() {
                            debug!(%host, %ip, "Resolved allowlisted host");
                            by_ip.insert(ip, host.clone());
                        }
                    }
                }
                Err(e) => warn!(%host, error = %e, "Failed to resolve allowlisted host"),
            }
        }

        info!(addresses = by_ip.len(), "Resolved interception allowlist");
        ResolvedPolicy { by_ip }
    }
}

/// The allowlist as IPv4 addresses, used by the packet loop.
#[derive(Debug, Clone, Default)]
pub struct ResolvedPolicy {
    by_ip: HashMap<Ipv4Addr, String>,
}

impl ResolvedPolicy {
    pub fn from_pairs<S: Into<String>>(pairs: impl IntoIterator<Item = (Ipv4Addr, S)>) -> Self {
        Self {
            by_ip: pairs.into_iter().map(|(ip, h)| (ip, h.into())).collect(),
        }
    }

    /// The allowlisted host an address belongs to.
    pub fn match_ip(&self, ip: &Ipv4Addr) -> Option<&str> {
        self.by_ip.get(ip).map(String::as_str)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Ipv4Addr> {
        self.by_ip.keys()
    }

    pub fn len(&self) -> usize {
        self.by_ip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ip.is_empty()
    }
}

/// Exact or `*.suffix` match, case-insensitive, ignoring a trailing port.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    let host = host.split(':').next().unwrap_or(host);
    if let Some(suffix) = pattern.strip_prefix("*.") {
        let host = host.to_ascii_lowercase();
        let suffix = suffix.to_ascii_lowercase();
        host.len() > suffix.len()
            && host.ends_with(&suffix)
            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
    } else {
        pattern.eq_ignore_ascii_case(host)
    }
}
