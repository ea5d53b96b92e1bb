//! Integration tests for the flow relay over loopback sockets.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use otokit_tunnel::policy::WAHLAP_AUTH_HOST;
use otokit_tunnel::{
    ConnectionTable, Extraction, FlowRelay, InterceptPolicy, NatEntry, RelayConfig, RelayHandle,
};

const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

struct Harness {
    relay: RelayHandle,
    table: Arc<ConnectionTable>,
    extractions: mpsc::UnboundedReceiver<Extraction>,
}

impl Harness {
    async fn start(policy: InterceptPolicy) -> Result<Self> {
        Self::start_with_idle(policy, RelayConfig::default().idle_timeout).await
    }

    async fn start_with_idle(policy: InterceptPolicy, idle: Duration) -> Result<Self> {
        let table = Arc::new(ConnectionTable::new(Duration::from_secs(60)));
        let config = RelayConfig::default()
            .with_listen(SocketAddr::V4(SocketAddrV4::new(LOOPBACK, 0)))
            .with_callback_base("http://127.0.0.1:34125")
            .with_idle_timeout(idle);
        let (relay, extractions) = FlowRelay::new(config, policy, Arc::clone(&table));
        let relay = relay.bind().await?;
        Ok(Self {
            relay,
            table,
            extractions,
        })
    }

    /// Connect to the relay as if the packet loop had redirected a flow
    /// bound for `upstream`.
    async fn connect(&self, upstream: SocketAddr, host: &str) -> Result<TcpStream> {
        let SocketAddr::V4(upstream) = upstream else {
            anyhow::bail!("expected an IPv4 upstream");
        };
        let socket = TcpSocket::new_v4()?;
        socket.bind(SocketAddr::V4(SocketAddrV4::new(LOOPBACK, 0)))?;
        let local = socket.local_addr()?;
        let SocketAddr::V4(local) = local else {
            anyhow::bail!("expected an IPv4 local address");
        };
        self.table.insert(NatEntry::new(local, upstream, host));
        Ok(socket.connect(self.relay.local_addr()).await?)
    }

    fn drain(&mut self) -> Vec<Extraction> {
        let mut out = Vec::new();
        while let Ok(e) = self.extractions.try_recv() {
            out.push(e);
        }
        out
    }
}

/// Upstream that echoes everything back.
async fn echo_upstream() -> Result<SocketAddr> {
    let listener = TcpListener::bind((LOOPBACK, 0)).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    Ok(addr)
}

/// Upstream that captures one request head and answers with a fixed response.
async fn http_upstream(response: &'static [u8]) -> Result<(SocketAddr, oneshot::Receiver<String>)> {
    let listener = TcpListener::bind((LOOPBACK, 0)).await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
            let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
            let _ = stream.write_all(response).await;
            let _ = stream.shutdown().await;
        }
    });
    Ok((addr, rx))
}

/// Upstream that writes until the connection breaks, then reports it.
async fn flooding_upstream() -> Result<(SocketAddr, oneshot::Receiver<()>)> {
    let listener = TcpListener::bind((LOOPBACK, 0)).await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let chunk = vec![0x5a; 64 * 1024];
            while stream.write_all(&chunk).await.is_ok() {}
            let _ = tx.send(());
        }
    });
    Ok((addr, rx))
}

async fn read_to_end(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut out)).await??;
    Ok(out)
}

#[tokio::test]
async fn test_uninspected_flow_relayed_byte_for_byte() -> Result<()> {
    let harness = Harness::start(InterceptPolicy::default()).await?;
    let upstream = echo_upstream().await?;

    let mut client = harness.connect(upstream, "maimai.wahlap.com").await?;
    let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    client.write_all(&payload).await?;
    client.shutdown().await?;

    assert_eq!(read_to_end(&mut client).await?, payload);
    Ok(())
}

#[tokio::test]
async fn test_tls_on_inspected_host_passes_through() -> Result<()> {
    let mut harness = Harness::start(InterceptPolicy::default()).await?;
    let upstream = echo_upstream().await?;

    let mut client = harness.connect(upstream, WAHLAP_AUTH_HOST).await?;
    let hello = [0x16, 0x03, 0x01, 0x00, 0x04, 0xde, 0xad, 0xbe, 0xef];
    client.write_all(&hello).await?;
    client.shutdown().await?;

    assert_eq!(read_to_end(&mut client).await?, hello);
    assert!(harness.drain().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_callback_request_redirected_locally() -> Result<()> {
    let mut harness = Harness::start(InterceptPolicy::default()).await?;
    // Never contacted: the relay answers the callback itself.
    let (upstream, captured) = http_upstream(b"HTTP/1.1 500 Unreachable\r\n\r\n").await?;

    let mut client = harness.connect(upstream, WAHLAP_AUTH_HOST).await?;
    client
        .write_all(
            b"GET /wc_auth/oauth/callback/maimai-dx?r=c&code=abc HTTP/1.1\r\n\
Host: tgk-wcaime.wahlap.com\r\n\
Cookie: _t=tok\r\n\r\n",
        )
        .await?;

    let response = String::from_utf8(read_to_end(&mut client).await?)?;
    assert!(response.starts_with("HTTP/1.1 302 Found\r\n"));
    assert!(response.contains(
        "Location: http://127.0.0.1:34125/wc_auth/oauth/callback/maimai-dx?r=c&code=abc\r\n"
    ));

    let extractions = harness.drain();
    assert!(extractions.contains(&Extraction::Cookie {
        host: WAHLAP_AUTH_HOST.to_string(),
        name: "_t".to_string(),
        value: "tok".to_string(),
    }));
    assert!(extractions.contains(&Extraction::AuthRedirect {
        url: "http://127.0.0.1:34125/wc_auth/oauth/callback/maimai-dx?r=c&code=abc".to_string(),
    }));

    drop(captured);
    Ok(())
}

#[tokio::test]
async fn test_inspected_request_gets_headers_and_set_cookie_extracted() -> Result<()> {
    let policy = InterceptPolicy::default().with_header("X-Requested-With", "otokit");
    let mut harness = Harness::start(policy).await?;
    let (upstream, captured) = http_upstream(
        b"HTTP/1.1 200 OK\r\nSet-Cookie: userId=42; Path=/\r\nContent-Length: 2\r\n\r\nok",
    )
    .await?;

    let mut client = harness.connect(upstream, WAHLAP_AUTH_HOST).await?;
    client
        .write_all(b"GET /home HTTP/1.1\r\nHost: tgk-wcaime.wahlap.com\r\n\r\n")
        .await?;

    let response = String::from_utf8(read_to_end(&mut client).await?)?;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("ok"));

    let seen = timeout(Duration::from_secs(5), captured).await??;
    assert!(seen.starts_with("GET /home HTTP/1.1\r\n"));
    assert!(seen.contains("X-Requested-With: otokit\r\n"));

    assert!(harness.drain().contains(&Extraction::Cookie {
        host: WAHLAP_AUTH_HOST.to_string(),
        name: "userId".to_string(),
        value: "42".to_string(),
    }));
    Ok(())
}

#[tokio::test]
async fn test_flow_closed_when_client_stops_reading() -> Result<()> {
    let harness =
        Harness::start_with_idle(InterceptPolicy::default(), Duration::from_millis(300)).await?;
    let (upstream, broken) = flooding_upstream().await?;

    // Never read: the relay's writes to the client back up.
    let client = harness.connect(upstream, "maimai.wahlap.com").await?;

    timeout(Duration::from_secs(5), broken).await??;
    drop(client);
    Ok(())
}

#[tokio::test]
async fn test_idle_flow_closed() -> Result<()> {
    let harness =
        Harness::start_with_idle(InterceptPolicy::default(), Duration::from_millis(300)).await?;
    let upstream = echo_upstream().await?;

    let mut client = harness.connect(upstream, "maimai.wahlap.com").await?;
    client.write_all(b"ping").await?;
    assert_eq!(read_to_end(&mut client).await?, b"ping");
    Ok(())
}

#[tokio::test]
async fn test_flow_without_table_entry_is_closed() -> Result<()> {
    let harness = Harness::start(InterceptPolicy::default()).await?;

    let mut client = TcpStream::connect(harness.relay.local_addr()).await?;
    client.write_all(b"hello").await?;
    assert!(read_to_end(&mut client).await.unwrap_or_default().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_relay_stop_is_idempotent() -> Result<()> {
    let mut harness = Harness::start(InterceptPolicy::default()).await?;
    let addr = harness.relay.local_addr();
    harness.relay.stop().await;
    harness.relay.stop().await;
    assert!(TcpStream::connect(addr).await.is_err());
    Ok(())
}
