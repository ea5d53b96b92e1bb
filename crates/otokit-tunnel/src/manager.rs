//! Tunnel manager: the packet loop.
//!
//! Every packet read from the device is classified:
//!
//! ```text
//! client → allowlisted host    rewrite dst to the relay, remember the true dst
//! relay  → client              rewrite src back to the true dst
//! anything else                forward unchanged
//! malformed                    drop
//! ```
//!
//! Rewritten packets are written back into the device so the kernel
//! delivers them to the relay listener (or to the client).

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use otokit_types::SharedEventSink;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::device::{DEFAULT_MTU, DropSink, PacketDevice, PacketSink, TunDevice};
use crate::error::Result;
use crate::nat::{ConnectionTable, NatEntry};
use crate::packet::{self, Packet, TcpPacket};
use crate::policy::ResolvedPolicy;

/// Status published when the packet loop starts.
pub const STATUS_STARTED: &str = "隧道已启动";

/// Status published when the packet loop exits.
pub const STATUS_STOPPED: &str = "隧道已关闭";

const MAX_PACKET_SIZE: usize = 65535;

/// Tunnel interface and NAT settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Address assigned to the interface; clients originate from it.
    pub address: Ipv4Addr,
    pub prefix: u8,
    pub mtu: u16,
    /// Port the flow relay listens on, on `address`.
    pub relay_port: u16,
    /// Idle time after which a connection-table entry is evicted.
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::new(10, 8, 0, 2),
            prefix: 24,
            mtu: DEFAULT_MTU,
            relay_port: 18080,
            idle_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl TunnelConfig {
    /// Where redirected flows are delivered.
    pub fn relay_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.address, self.relay_port)
    }
}

/// What the loop does with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Rewritten in place; write it back into the device.
    Inject,
    /// Hand to the passthrough sink unchanged.
    Forward,
    Drop,
}

/// Packet counters.
#[derive(Debug, Default)]
pub struct TunnelStats {
    read: AtomicU64,
    injected: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl TunnelStats {
    pub fn packets_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn packets_injected(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    pub fn packets_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn packets_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record(&self, verdict: Verdict) {
        let counter = match verdict {
            Verdict::Inject => &self.injected,
            Verdict::Forward => &self.forwarded,
            Verdict::Drop => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Owns the classification state of one tunnel.
pub struct TunnelManager {
    config: TunnelConfig,
    policy: ResolvedPolicy,
    table: Arc<ConnectionTable>,
    sink: Arc<dyn PacketSink>,
    events: SharedEventSink,
    stats: Arc<TunnelStats>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig, policy: ResolvedPolicy, events: SharedEventSink) -> Self {
        let table = Arc::new(ConnectionTable::new(config.idle_timeout));
        Self {
            config,
            policy,
            table,
            sink: Arc::new(DropSink),
            events,
            stats: Arc::new(TunnelStats::default()),
        }
    }

    /// Where packets that are not redirected go.
    pub fn with_sink(mut self, sink: Arc<dyn PacketSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Share an existing connection table (the relay reads the same one).
    pub fn with_table(mut self, table: Arc<ConnectionTable>) -> Self {
        self.table = table;
        self
    }

    pub fn table(&self) -> Arc<ConnectionTable> {
        Arc::clone(&self.table)
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Create the tun interface, route the allowlist through it and start
    /// the packet loop.
    ///
    /// A preparation failure is reported once on the event stream (status
    /// cleared, one error) and returned; the loop never starts.
    pub fn start(self) -> Result<TunnelHandle> {
        let device = match TunDevice::create(self.config.address, self.config.prefix, self.config.mtu)
        {
            Ok(device) => device,
            Err(e) => {
                error!(error = %e, "Tunnel preparation failed");
                self.events.set_status(None, false);
                self.events.emit(otokit_types::RunEvent::error(e.to_string()));
                return Err(e);
            }
        };
        device.install_routes(self.policy.addresses());
        Ok(self.start_with_device(Arc::new(device)))
    }

    /// Start the packet loop on an already opened device.
    pub fn start_with_device(self, device: Arc<dyn PacketDevice>) -> TunnelHandle {
        let cancel = CancellationToken::new();
        let interface = device.name();
        let manager = Arc::new(self);

        info!(
            %interface,
            relay = %manager.config.relay_addr(),
            allowlisted = manager.policy.len(),
            "Starting tunnel"
        );
        manager
            .events
            .set_status(Some(STATUS_STARTED.to_string()), true);

        let task = tokio::spawn(packet_loop(
            Arc::clone(&manager),
            device,
            cancel.clone(),
        ));

        TunnelHandle {
            cancel,
            task: Some(task),
            stats: Arc::clone(&manager.stats),
            table: Arc::clone(&manager.table),
            interface,
        }
    }

    /// Classify one packet, rewriting it in place when redirected.
    pub fn classify(&self, packet: &mut [u8]) -> Verdict {
        let info = match packet::parse(packet) {
            Ok(Packet::Tcp(info)) => info,
            Ok(Packet::Other) => return Verdict::Forward,
            Err(e) => {
                trace!(error = %e, "Dropping malformed packet");
                return Verdict::Drop;
            }
        };

        let relay = self.config.relay_addr();

        if info.src == relay {
            let client_port = info.dst.port();
            let Some(entry) = self.table.touch(client_port) else {
                debug!(client_port, "Relay packet for unknown flow");
                return Verdict::Drop;
            };
            packet::rewrite_tcp(packet, &info, entry.original_dst, entry.client);
            self.track_close(&info, client_port, false);
            return Verdict::Inject;
        }

        if *info.src.ip() != self.config.address {
            return Verdict::Forward;
        }

        let client_port = info.src.port();
        let existing = self
            .table
            .touch(client_port)
            .filter(|entry| entry.original_dst == info.dst);

        let entry = match existing {
            Some(entry) => entry,
            None => {
                let Some(host) = self.policy.match_ip(info.dst.ip()) else {
                    return Verdict::Forward;
                };
                // Mid-stream segments of flows that predate the tunnel pass through.
                if !info.flags.is_open() {
                    return Verdict::Forward;
                }
                let entry = NatEntry::new(info.src, info.dst, host);
                debug!(client_port, dst = %info.dst, %host, "Redirecting new flow");
                self.table.insert(entry.clone());
                entry
            }
        };

        let fake_peer = SocketAddrV4::new(*entry.original_dst.ip(), client_port);
        packet::rewrite_tcp(packet, &info, fake_peer, relay);
        self.track_close(&info, client_port, true);
        Verdict::Inject
    }

    fn track_close(&self, info: &TcpPacket, client_port: u16, from_client: bool) {
        if info.flags.rst() {
            self.table.remove(client_port);
        } else if info.flags.fin() {
            self.table.mark_fin(client_port, from_client);
        }
    }
}

async fn packet_loop(
    manager: Arc<TunnelManager>,
    device: Arc<dyn PacketDevice>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let mut sweep = tokio::time::interval(manager.config.sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => {
                let evicted = manager.table.sweep(Instant::now());
                if evicted > 0 {
                    debug!(evicted, active = manager.table.len(), "Evicted connection table entries");
                }
            }
            read = device.recv(&mut buf) => {
                let n = match read {
                    Ok(0) => {
                        info!("Tunnel device closed");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) if matches!(e.kind(), std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock) => continue,
                    Err(e) => {
                        error!(error = %e, "Tunnel read failed");
                        break;
                    }
                };

                manager.stats.read.fetch_add(1, Ordering::Relaxed);
                let packet = &mut buf[..n];
                let verdict = manager.classify(packet);
                match verdict {
                    Verdict::Inject => {
                        if let Err(e) = device.send(packet).await {
                            warn!(error = %e, "Failed to write rewritten packet");
                        }
                    }
                    Verdict::Forward => manager.sink.forward(packet),
                    Verdict::Drop => {}
                }
                manager.stats.record(verdict);
            }
        }
    }

    manager.table.clear();
    info!(
        read = manager.stats.packets_read(),
        injected = manager.stats.packets_injected(),
        forwarded = manager.stats.packets_forwarded(),
        dropped = manager.stats.packets_dropped(),
        "Tunnel stopped"
    );
    manager
        .events
        .set_status(Some(STATUS_STOPPED.to_string()), false);
}

/// Handle to a running packet loop.
pub struct TunnelHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    stats: Arc<TunnelStats>,
    table: Arc<ConnectionTable>,
    interface: String,
}

impl TunnelHandle {
    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn stats(&self) -> &TunnelStats {
        &self.stats
    }

    pub fn table(&self) -> Arc<ConnectionTable> {
        Arc::clone(&self.table)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop and wait for it to exit. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Tunnel task ended abnormally");
        }
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
