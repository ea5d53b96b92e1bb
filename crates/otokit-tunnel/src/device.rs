//! Packet device seam.
//!
//! The packet loop reads and writes raw IP packets through [`PacketDevice`].
//! Production uses a tun-rs interface ([`TunDevice`]); tests drive the loop
//! through an in-memory [`MemoryDevice`]. Packets the tunnel does not touch
//! leave through a [`PacketSink`].

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, trace, warn};

use crate::error::{Result, TunnelError};

/// Default MTU of the tunnel interface.
pub const DEFAULT_MTU: u16 = 1500;

/// Source and destination of raw IP packets.
#[async_trait]
pub trait PacketDevice: Send + Sync {
    /// Read one packet. `Ok(0)` means the device is closed.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet back into the interface.
    async fn send(&self, packet: &[u8]) -> io::Result<usize>;

    fn name(&self) -> String;
}

/// Receiver of packets forwarded unchanged.
pub trait PacketSink: Send + Sync {
    fn forward(&self, packet: &[u8]);
}

/// Whether this process may create a tunnel interface.
pub fn can_create_device() -> bool {
    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// tun-rs device
// ─────────────────────────────────────────────────────────────────────────────

/// A tun interface created through tun-rs.
pub struct TunDevice {
    device: tun_rs::AsyncDevice,
    name: String,
}

impl TunDevice {
    /// Create and address the interface.
    ///
    /// Fails with [`TunnelError::Preparation`] when the process lacks the
    /// privileges to create interfaces or the platform refuses.
    pub fn create(address: Ipv4Addr, prefix: u8, mtu: u16) -> Result<Self> {
        if !can_create_device() {
            return Err(TunnelError::Preparation(
                "root privileges required to create the tunnel interface".to_string(),
            ));
        }

        let device = tun_rs::DeviceBuilder::new()
            .ipv4(address, prefix, None)
            .mtu(mtu)
            .build_async()
            .map_err(|e| TunnelError::Preparation(format!("failed to create tun device: {}", e)))?;

        let name = device
            .name()
            .map_err(|e| TunnelError::Preparation(format!("failed to get interface name: {}", e)))?;

        info!(interface = %name, %address, prefix, mtu, "Tunnel interface created");
        Ok(Self { device, name })
    }

    /// Route the given addresses through the interface.
    ///
    /// Route failures are logged and skipped; an address without a route
    /// simply bypasses the tunnel.
    pub fn install_routes<'a>(&self, addresses: impl IntoIterator<Item = &'a Ipv4Addr>) {
        for ip in addresses {
            let output = route_command(&self.name, ip).output();
            match output {
                Ok(out) if out.status.success() => {
                    info!(interface = %self.name, %ip, "Route installed");
                }
                Ok(out) => {
                    let stderr = String::from_utf8_lossy(&out.stderr);
                    warn!(interface = %self.name, %ip, %stderr, "Failed to install route");
                }
                Err(e) => warn!(interface = %self.name, %ip, error = %e, "Failed to run route command"),
            }
        }
    }
}

#[cfg(target_os = "macos")]
fn route_command(interface: &str, ip: &Ipv4Addr) -> std::process::Command {
    let mut cmd = std::process::Command::new("route");
    cmd.args(["-n", "add", "-host", &ip.to_string(), "-interface", interface]);
    cmd
}

#[cfg(not(target_os = "macos"))]
fn route_command(interface: &str, ip: &Ipv4Addr) -> std::process::Command {
    let mut cmd = std::process::Command::new("ip");
    cmd.args(["route", "replace", &format!("{}/32", ip), "dev", interface]);
    cmd
}

#[async_trait]
impl PacketDevice for TunDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.recv(buf).await
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        self.device.send(packet).await
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory device
// ─────────────────────────────────────────────────────────────────────────────

/// Channel-backed device for driving the packet loop without an interface.
pub struct MemoryDevice {
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// The other end of a [`MemoryDevice`].
pub struct MemoryDeviceHandle {
    /// Packets to be read by the loop. Dropping it closes the device.
    pub inject: mpsc::UnboundedSender<Vec<u8>>,
    /// Packets the loop wrote back into the interface.
    pub written: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryDevice {
    pub fn pair() -> (Arc<Self>, MemoryDeviceHandle) {
        let (inject, inbound) = mpsc::unbounded_channel();
        let (outbound, written) = mpsc::unbounded_channel();
        let device = Arc::new(Self {
            inbound: Mutex::new(inbound),
            outbound,
        });
        (device, MemoryDeviceHandle { inject, written })
    }
}

#[async_trait]
impl PacketDevice for MemoryDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        self.outbound
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "memory device closed"))?;
        Ok(packet.len())
    }

    fn name(&self) -> String {
        "memory".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sinks
// ─────────────────────────────────────────────────────────────────────────────

/// Hands forwarded packets to a channel, byte for byte.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PacketSink for ChannelSink {
    fn forward(&self, packet: &[u8]) {
        if self.tx.send(packet.to_vec()).is_err() {
            trace!(len = packet.len(), "Passthrough receiver gone");
        }
    }
}

/// Sink for deployments where only allowlisted addresses are routed into the
/// tunnel, so nothing else is expected to arrive.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropSink;

impl PacketSink for DropSink {
    fn forward(&self, packet: &[u8]) {
        trace!(len = packet.len(), "Dropping unrouted passthrough packet");
    }
}
