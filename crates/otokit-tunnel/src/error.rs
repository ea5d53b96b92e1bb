//! Error types for the tunnel and relay.

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors raised by the tunnel manager and flow relay.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// The virtual interface could not be created. Fatal for the run.
    #[error("Tunnel preparation failed: {0}")]
    Preparation(String),

    /// Binding a local listener failed.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// Relayed connections have no interface to leave through and would
    /// loop back into the tunnel.
    #[error("No egress interface: {0}")]
    NoEgressInterface(String),

    /// A flow had no connection-table entry.
    #[error("No connection table entry for client port {0}")]
    UnknownFlow(u16),

    /// IO error on the device or a relayed socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a packet could not be parsed. Never surfaced past the packet loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("unknown IP version {0}")]
    UnknownVersion(u8),

    #[error("packet shorter than its headers ({0} bytes)")]
    Truncated(usize),

    #[error("invalid IPv4 header length {0}")]
    BadHeaderLength(usize),

    #[error("total length {total} exceeds buffer of {available} bytes")]
    BadTotalLength { total: usize, available: usize },

    #[error("invalid TCP data offset {0}")]
    BadDataOffset(usize),
}
