//! Best-effort IPv4/TCP header handling.
//!
//! Only what the packet loop needs: classify a raw IP packet, rewrite the
//! address/port tuple of a TCP segment, and recompute the IPv4 header and TCP
//! checksums (RFC 1071 one's complement sums).

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::PacketError;

/// IP protocol number for TCP.
pub const PROTO_TCP: u8 = 6;

const IPV4_MIN_HEADER: usize = 20;
const TCP_MIN_HEADER: usize = 20;
const TCP_CHECKSUM_OFFSET: usize = 16;

/// TCP control bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;

    pub fn fin(self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn syn(self) -> bool {
        self.0 & Self::SYN != 0
    }

    pub fn rst(self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn ack(self) -> bool {
        self.0 & Self::ACK != 0
    }

    /// A connection-opening SYN (no ACK).
    pub fn is_open(self) -> bool {
        self.syn() && !self.ack()
    }
}

/// Parsed view of an IPv4/TCP segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpPacket {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub flags: TcpFlags,
    /// IPv4 header length in bytes.
    pub ip_header_len: usize,
    /// IPv4 total length; bytes past this are link padding.
    pub total_len: usize,
    pub payload_len: usize,
}

/// Classification of a raw packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    Tcp(TcpPacket),
    /// Well-formed but not something the tunnel rewrites (IPv6, UDP, ICMP,
    /// non-initial fragments).
    Other,
}

/// Parse a raw IP packet.
pub fn parse(data: &[u8]) -> Result<Packet, PacketError> {
    let Some(&first) = data.first() else {
        return Err(PacketError::Truncated(0));
    };

    match first >> 4 {
        4 => {}
        6 => return Ok(Packet::Other),
        v => return Err(PacketError::UnknownVersion(v)),
    }

    if data.len() < IPV4_MIN_HEADER {
        return Err(PacketError::Truncated(data.len()));
    }

    let ihl = (first & 0x0f) as usize * 4;
    if ihl < IPV4_MIN_HEADER || ihl > data.len() {
        return Err(PacketError::BadHeaderLength(ihl));
    }

    let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if total_len < ihl || total_len > data.len() {
        return Err(PacketError::BadTotalLength {
            total: total_len,
            available: data.len(),
        });
    }

    let fragment_offset = u16::from_be_bytes([data[6], data[7]]) & 0x1fff;
    if data[9] != PROTO_TCP || fragment_offset != 0 {
        return Ok(Packet::Other);
    }

    if total_len < ihl + TCP_MIN_HEADER {
        return Err(PacketError::Truncated(total_len));
    }

    let tcp = &data[ihl..total_len];
    let data_offset = (tcp[12] >> 4) as usize * 4;
    if data_offset < TCP_MIN_HEADER || data_offset > tcp.len() {
        return Err(PacketError::BadDataOffset(data_offset));
    }

    let src_ip = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst_ip = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);

    Ok(Packet::Tcp(TcpPacket {
        src: SocketAddrV4::new(src_ip, src_port),
        dst: SocketAddrV4::new(dst_ip, dst_port),
        flags: TcpFlags(tcp[13]),
        ip_header_len: ihl,
        total_len,
        payload_len: tcp.len() - data_offset,
    }))
}

/// Rewrite the address/port tuple of a parsed TCP packet in place and fix
/// both checksums.
pub fn rewrite_tcp(packet: &mut [u8], info: &TcpPacket, src: SocketAddrV4, dst: SocketAddrV4) {
    let ihl = info.ip_header_len;

    packet[12..16].copy_from_slice(&src.ip().octets());
    packet[16..20].copy_from_slice(&dst.ip().octets());
    packet[ihl..ihl + 2].copy_from_slice(&src.port().to_be_bytes());
    packet[ihl + 2..ihl + 4].copy_from_slice(&dst.port().to_be_bytes());

    packet[10..12].fill(0);
    let ip_sum = ipv4_checksum(&packet[..ihl]);
    packet[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    let sum_at = ihl + TCP_CHECKSUM_OFFSET;
    packet[sum_at..sum_at + 2].fill(0);
    let tcp_sum = tcp_checksum(*src.ip(), *dst.ip(), &packet[ihl..info.total_len]);
    packet[sum_at..sum_at + 2].copy_from_slice(&tcp_sum.to_be_bytes());
}

/// IPv4 header checksum. The checksum field must be zeroed by the caller.
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    fold(sum_words(header, 0))
}

/// TCP checksum over the pseudo-header and segment. The checksum field must
/// be zeroed by the caller.
pub fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut acc = sum_words(&src.octets(), 0);
    acc = sum_words(&dst.octets(), acc);
    acc += PROTO_TCP as u32;
    acc += segment.len() as u32;
    fold(sum_words(segment, acc))
}

/// Whether the IPv4 header and TCP checksums of a packet verify.
pub fn checksums_valid(packet: &[u8]) -> bool {
    let Ok(Packet::Tcp(info)) = parse(packet) else {
        return false;
    };
    let ihl = info.ip_header_len;
    let ip_ok = fold(sum_words(&packet[..ihl], 0)) == 0;

    let segment = &packet[ihl..info.total_len];
    let mut acc = sum_words(&info.src.ip().octets(), 0);
    acc = sum_words(&info.dst.ip().octets(), acc);
    acc += PROTO_TCP as u32 + segment.len() as u32;
    let tcp_ok = fold(sum_words(segment, acc)) == 0;

    ip_ok && tcp_ok
}

fn sum_words(data: &[u8], mut acc: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        acc += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        acc += (*last as u32) << 8;
    }
    acc
}

fn fold(mut acc: u32) -> u16 {
    while acc >> 16 != 0 {
        acc = (acc & 0xffff) + (acc >> 16);
    }
    !(acc as u16)
}

/// Build a minimal IPv4/TCP packet with valid checksums.
///
/// Used by tests and by diagnostics that need to synthesize segments.
pub fn build_tcp(src: SocketAddrV4, dst: SocketAddrV4, flags: u8, payload: &[u8]) -> Vec<u8> {
    let total = IPV4_MIN_HEADER + TCP_MIN_HEADER + payload.len();
    let mut packet = vec![0u8; total];

    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[6] = 0x40; // don't fragment
    packet[8] = 64;
    packet[9] = PROTO_TCP;

    let tcp = IPV4_MIN_HEADER;
    packet[tcp + 4..tcp + 8].copy_from_slice(&1u32.to_be_bytes());
    packet[tcp + 12] = ((TCP_MIN_HEADER / 4) as u8) << 4;
    packet[tcp + 13] = flags;
    packet[tcp + 14..tcp + 16].copy_from_slice(&65535u16.to_be_bytes());
    packet[tcp + TCP_MIN_HEADER..].copy_from_slice(payload);

    let info = TcpPacket {
        src,
        dst,
        flags: TcpFlags(flags),
        ip_header_len: IPV4_MIN_HEADER,
        total_len: total,
        payload_len: payload.len(),
    };
    rewrite_tcp(&mut packet, &info, src, dst);
    packet
}
