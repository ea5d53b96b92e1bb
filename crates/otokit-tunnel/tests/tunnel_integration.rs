//! Packet loop driven through an in-memory device.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::time::timeout;

use otokit_tunnel::packet::{self, Packet, TcpFlags, build_tcp, checksums_valid};
use otokit_tunnel::{
    ChannelSink, MemoryDevice, ResolvedPolicy, TunnelConfig, TunnelManager,
};
use otokit_types::{EventSink, RunEvent};

const VENDOR: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);
const STRANGER: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 20);

#[derive(Default)]
struct Recorder(Mutex<Vec<RunEvent>>);

impl EventSink for Recorder {
    fn emit(&self, event: RunEvent) {
        self.0.lock().push(event);
    }
}

fn client(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(TunnelConfig::default().address, port)
}

#[tokio::test]
async fn test_redirect_roundtrip_and_passthrough() -> Result<()> {
    let config = TunnelConfig::default();
    let relay = config.relay_addr();
    let policy = ResolvedPolicy::from_pairs([(VENDOR, "maimai.wahlap.com")]);
    let events = Arc::new(Recorder::default());
    let (sink, mut forwarded) = ChannelSink::new();
    let manager = TunnelManager::new(config, policy, events.clone()).with_sink(Arc::new(sink));

    let (device, mut io) = MemoryDevice::pair();
    let mut handle = manager.start_with_device(device);

    // Client SYN to the vendor is redirected to the relay.
    let vendor = SocketAddrV4::new(VENDOR, 80);
    io.inject
        .send(build_tcp(client(41000), vendor, TcpFlags::SYN, b""))?;
    let rewritten = timeout(Duration::from_secs(5), io.written.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("device closed"))?;
    let Packet::Tcp(info) = packet::parse(&rewritten)? else {
        anyhow::bail!("expected tcp");
    };
    assert_eq!(info.dst, relay);
    assert_eq!(info.src, SocketAddrV4::new(VENDOR, 41000));
    assert!(checksums_valid(&rewritten));

    // The relay's SYN-ACK goes back to the client as if from the vendor.
    io.inject.send(build_tcp(
        relay,
        SocketAddrV4::new(VENDOR, 41000),
        TcpFlags::SYN | TcpFlags::ACK,
        b"",
    ))?;
    let reply = timeout(Duration::from_secs(5), io.written.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("device closed"))?;
    let Packet::Tcp(info) = packet::parse(&reply)? else {
        anyhow::bail!("expected tcp");
    };
    assert_eq!(info.src, vendor);
    assert_eq!(info.dst, client(41000));

    // Traffic to anyone else is forwarded byte-identical.
    let stray = build_tcp(client(41001), SocketAddrV4::new(STRANGER, 443), TcpFlags::SYN, b"x");
    io.inject.send(stray.clone())?;
    let passed = timeout(Duration::from_secs(5), forwarded.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("sink closed"))?;
    assert_eq!(passed, stray);

    // Non-TCP is forwarded too.
    let mut udp = stray.clone();
    udp[9] = 17;
    io.inject.send(udp.clone())?;
    let passed = timeout(Duration::from_secs(5), forwarded.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("sink closed"))?;
    assert_eq!(passed, udp);

    assert_eq!(handle.table().len(), 1);
    handle.stop().await;
    assert!(handle.table().is_empty());
    assert_eq!(handle.stats().packets_injected(), 2);
    assert_eq!(handle.stats().packets_forwarded(), 2);
    Ok(())
}

#[tokio::test]
async fn test_closed_device_stops_loop() -> Result<()> {
    let events = Arc::new(Recorder::default());
    let manager = TunnelManager::new(TunnelConfig::default(), ResolvedPolicy::default(), events.clone());
    let (device, io) = MemoryDevice::pair();
    let mut handle = manager.start_with_device(device);

    drop(io);
    timeout(Duration::from_secs(5), handle.stop()).await?;

    let events = events.0.lock().clone();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1], RunEvent::status(Some("隧道已关闭".to_string()), false));
    Ok(())
}
