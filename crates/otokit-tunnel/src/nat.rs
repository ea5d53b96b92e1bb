//! Connection table for redirected flows.
//!
//! Keyed by the client's source port: every redirected flow originates from
//! the tunnel address, so the port alone identifies it. The packet loop
//! writes entries, the relay reads them to find each flow's true
//! destination.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// How long an entry survives after both sides sent FIN, so the final ACKs
/// still get translated.
pub const FIN_GRACE: Duration = Duration::from_secs(2);

/// One redirected flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatEntry {
    /// The client endpoint on the tunnel address.
    pub client: SocketAddrV4,
    /// Where the client was actually connecting.
    pub original_dst: SocketAddrV4,
    /// Allowlist entry that matched the destination.
    pub host: String,
    pub created_at: Instant,
    pub last_seen: Instant,
    client_fin: bool,
    remote_fin: bool,
    closed_at: Option<Instant>,
}

impl NatEntry {
    pub fn new(client: SocketAddrV4, original_dst: SocketAddrV4, host: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            client,
            original_dst,
            host: host.into(),
            created_at: now,
            last_seen: now,
            client_fin: false,
            remote_fin: false,
            closed_at: None,
        }
    }

    /// Both directions have been closed.
    pub fn is_closing(&self) -> bool {
        self.closed_at.is_some()
    }
}

/// Shared table of active redirected flows.
#[derive(Debug)]
pub struct ConnectionTable {
    entries: Mutex<HashMap<u16, NatEntry>>,
    idle_timeout: Duration,
}

impl ConnectionTable {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Insert an entry for a new flow, replacing any stale entry on the same
    /// port. Returns `true` if a previous entry was replaced.
    pub fn insert(&self, entry: NatEntry) -> bool {
        let port = entry.client.port();
        self.entries.lock().insert(port, entry).is_some()
    }

    pub fn get(&self, client_port: u16) -> Option<NatEntry> {
        self.entries.lock().get(&client_port).cloned()
    }

    /// Refresh the idle timer of a flow and return its entry.
    pub fn touch(&self, client_port: u16) -> Option<NatEntry> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&client_port)?;
        entry.last_seen = Instant::now();
        Some(entry.clone())
    }

    /// Record a FIN from one side. Once both sides have sent FIN the entry
    /// is scheduled for eviction after [`FIN_GRACE`].
    pub fn mark_fin(&self, client_port: u16, from_client: bool) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&client_port) {
            if from_client {
                entry.client_fin = true;
            } else {
                entry.remote_fin = true;
            }
            if entry.client_fin && entry.remote_fin && entry.closed_at.is_none() {
                entry.closed_at = Some(Instant::now());
            }
        }
    }

    pub fn remove(&self, client_port: u16) -> Option<NatEntry> {
        self.entries.lock().remove(&client_port)
    }

    /// Evict idle entries and closed entries past their grace period.
    /// Returns how many entries were evicted.
    pub fn sweep(&self, now: Instant) -> usize {
        let idle_timeout = self.idle_timeout;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            let idle = now.saturating_duration_since(entry.last_seen) >= idle_timeout;
            let closed = entry
                .closed_at
                .is_some_and(|at| now.saturating_duration_since(at) >= FIN_GRACE);
            !(idle || closed)
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
