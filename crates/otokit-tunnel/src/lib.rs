//! Traffic-interception tunnel for otokit.
//!
//! Reads raw IP packets from a virtual interface, redirects TCP flows bound
//! for allowlisted hosts into a local relay, and forwards everything else
//! untouched.
//!
//! # Components
//!
//! - [`packet`]: best-effort IPv4/TCP parsing, address rewriting, checksums
//! - [`nat`]: connection table remembering each redirected flow's true destination
//! - [`policy`]: allowlist, inspection and redirect rules
//! - [`device`]: the [`PacketDevice`] seam (tun-rs in production, channels in tests)
//! - [`manager`]: the packet loop
//! - [`relay`]: per-connection proxy with HTTP head inspection

pub mod device;
pub mod error;
pub mod manager;
pub mod nat;
pub mod packet;
pub mod policy;
pub mod relay;

pub use device::{ChannelSink, DropSink, MemoryDevice, MemoryDeviceHandle, PacketDevice, PacketSink, TunDevice};
pub use error::{PacketError, Result, TunnelError};
pub use manager::{TunnelConfig, TunnelHandle, TunnelManager, TunnelStats, Verdict};
pub use nat::{ConnectionTable, NatEntry};
pub use policy::{InterceptPolicy, RedirectRule, ResolvedPolicy};
pub use relay::{Extraction, FlowRelay, RelayConfig, RelayHandle};
