//! Flow relay.
//!
//! Accepts the connections the packet loop redirected, looks up each
//! flow's true destination in the [`ConnectionTable`] and proxies it.
//! Flows to inspected hosts get their first request and response heads
//! parsed: cookies are extracted, configured headers injected, and
//! requests matching a redirect rule are answered locally with a 302 to
//! the callback listener. Anything that is not plaintext HTTP (TLS) is
//! relayed byte for byte.

pub mod http;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TunnelError};
use crate::nat::ConnectionTable;
use crate::policy::InterceptPolicy;
use http::{HeadRead, RequestHead, ResponseHead};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Relay listener and per-flow settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// A flow with no traffic in either direction for this long is closed.
    pub idle_timeout: Duration,
    /// How long to wait for each read while collecting an HTTP head.
    pub head_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_head_bytes: usize,
    /// Base URL of the local callback listener, e.g. `http://127.0.0.1:34125`.
    pub callback_base: String,
    /// Interface upstream sockets are bound to, so they bypass the tunnel
    /// routes. Required whenever the relay runs behind a tunnel.
    pub bind_device: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 8, 0, 2), 18080)),
            idle_timeout: Duration::from_secs(120),
            head_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            max_head_bytes: 16 * 1024,
            callback_base: "http://127.0.0.1:34125".to_string(),
            bind_device: None,
        }
    }
}

impl RelayConfig {
    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_callback_base(mut self, base: impl Into<String>) -> Self {
        self.callback_base = base.into();
        self
    }

    pub fn with_bind_device(mut self, device: impl Into<String>) -> Self {
        self.bind_device = Some(device.into());
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Data pulled out of inspected flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// A cookie seen in a request `Cookie` or response `Set-Cookie` header.
    Cookie {
        host: String,
        name: String,
        value: String,
    },
    /// An identity-provider callback was bounced to the local listener.
    AuthRedirect { url: String },
}

/// The relay, before it is bound.
pub struct FlowRelay {
    config: RelayConfig,
    policy: InterceptPolicy,
    table: Arc<ConnectionTable>,
    extractions: mpsc::UnboundedSender<Extraction>,
}

impl FlowRelay {
    /// Create a relay reading flows from `table`. Extractions arrive on the
    /// returned receiver.
    pub fn new(
        config: RelayConfig,
        policy: InterceptPolicy,
        table: Arc<ConnectionTable>,
    ) -> (Self, mpsc::UnboundedReceiver<Extraction>) {
        let (extractions, rx) = mpsc::unbounded_channel();
        let relay = Self {
            config,
            policy,
            table,
            extractions,
        };
        (relay, rx)
    }

    /// Bind the listener and start accepting flows.
    pub async fn bind(self) -> Result<RelayHandle> {
        let addr = self.config.listen;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TunnelError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Flow relay listening");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, Arc::new(self), cancel.clone()));

        Ok(RelayHandle {
            local_addr,
            cancel,
            task: Some(task),
        })
    }

    fn extract(&self, extraction: Extraction) {
        if self.extractions.send(extraction).is_err() {
            debug!("Extraction receiver gone");
        }
    }

    async fn handle_flow(&self, mut client: TcpStream, peer: SocketAddr) -> Result<()> {
        let client_port = peer.port();
        let entry = self
            .table
            .get(client_port)
            .ok_or(TunnelError::UnknownFlow(client_port))?;

        let mut host = entry.host.clone();
        let mut to_upstream = Vec::new();
        let mut inspect_response = false;

        if self.policy.is_inspected(&entry.host) {
            let head = http::read_head(
                &mut client,
                self.config.max_head_bytes,
                true,
                self.config.head_timeout,
            )
            .await?;

            match head {
                HeadRead::Complete { buf, head_len } => match RequestHead::parse(&buf[..head_len]) {
                    Ok(mut request) => {
                        if let Some(h) = request.host() {
                            host = h.split(':').next().unwrap_or(h).to_string();
                        }
                        for (name, value) in request.cookies() {
                            self.extract(Extraction::Cookie {
                                host: host.clone(),
                                name,
                                value,
                            });
                        }

                        if self.policy.redirect_for(&host, request.path()).is_some() {
                            let url = format!(
                                "{}{}",
                                self.config.callback_base.trim_end_matches('/'),
                                request.path_and_query()
                            );
                            info!(client_port, %host, path = request.path(), "Redirecting callback to local listener");
                            self.extract(Extraction::AuthRedirect { url: url.clone() });
                            client.write_all(&http::redirect_response(&url)).await?;
                            let _ = client.shutdown().await;
                            return Ok(());
                        }

                        for (name, value) in &self.policy.inject_headers {
                            request.set_header(name, value);
                        }
                        to_upstream = request.to_bytes();
                        to_upstream.extend_from_slice(&buf[head_len..]);
                        inspect_response = true;
                    }
                    Err(e) => {
                        debug!(client_port, error = %e, "Unparseable request head, relaying as-is");
                        to_upstream = buf;
                    }
                },
                HeadRead::Partial(buf) => to_upstream = buf,
            }
        }

        let mut upstream = self.connect_upstream(entry.original_dst).await?;
        debug!(client_port, dst = %entry.original_dst, %host, "Upstream connected");

        if !to_upstream.is_empty() {
            upstream.write_all(&to_upstream).await?;
        }

        if inspect_response {
            let head = http::read_head(
                &mut upstream,
                self.config.max_head_bytes,
                false,
                self.config.head_timeout,
            )
            .await?;
            let buf = match head {
                HeadRead::Complete { buf, head_len } => {
                    if let Ok(response) = ResponseHead::parse(&buf[..head_len]) {
                        for (name, value) in response.set_cookies() {
                            self.extract(Extraction::Cookie {
                                host: host.clone(),
                                name,
                                value,
                            });
                        }
                    }
                    buf
                }
                HeadRead::Partial(buf) => buf,
            };
            client.write_all(&buf).await?;
        }

        let (sent, received) = pump(client, upstream, self.config.idle_timeout).await;
        debug!(client_port, sent, received, "Flow closed");
        Ok(())
    }

    async fn connect_upstream(&self, dst: SocketAddrV4) -> Result<TcpStream> {
        let socket = TcpSocket::new_v4()?;

        if let Some(device) = &self.config.bind_device {
            bind_interface(&socket, device)?;
        }

        match tokio::time::timeout(self.config.connect_timeout, socket.connect(SocketAddr::V4(dst)))
            .await
        {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(TunnelError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {} timed out", dst),
            ))),
        }
    }
}

/// Pin an upstream socket to `device` so it leaves through the real
/// interface instead of the tunnel routes.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_interface(socket: &TcpSocket, device: &str) -> Result<()> {
    socket.bind_device(Some(device.as_bytes()))?;
    Ok(())
}

#[cfg(target_os = "macos")]
fn bind_interface(socket: &TcpSocket, device: &str) -> Result<()> {
    use std::os::fd::AsRawFd;

    let name = std::ffi::CString::new(device)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `name` is a valid NUL-terminated string.
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: the fd is owned by `socket` and `index` outlives the call.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_BOUND_IF,
            &index as *const libc::c_uint as *const libc::c_void,
            std::mem::size_of::<libc::c_uint>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
fn bind_interface(_socket: &TcpSocket, device: &str) -> Result<()> {
    Err(TunnelError::NoEgressInterface(format!(
        "binding to {} is not supported on this platform",
        device
    )))
}

async fn accept_loop(listener: TcpListener, relay: Arc<FlowRelay>, cancel: CancellationToken) {
    let mut flows = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let relay = Arc::clone(&relay);
                    flows.spawn(async move {
                        if let Err(e) = relay.handle_flow(stream, peer).await {
                            debug!(%peer, error = %e, "Flow ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Relay accept failed"),
            },
        }
        while flows.try_join_next().is_some() {}
    }

    flows.shutdown().await;
    info!("Flow relay stopped");
}

/// Last time either direction of a flow moved bytes.
struct Activity(parking_lot::Mutex<Instant>);

impl Activity {
    fn new() -> Self {
        Self(parking_lot::Mutex::new(Instant::now()))
    }

    fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.0.lock()
    }
}

/// Run the outbound and inbound halves of a flow until both are closed or
/// the flow goes idle. Returns bytes sent upstream and bytes received from
/// upstream.
async fn pump(client: TcpStream, upstream: TcpStream, idle: Duration) -> (u64, u64) {
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();
    let activity = Activity::new();
    let closed = CancellationToken::new();

    let halves = async {
        let counts = tokio::join!(
            copy_half(client_read, upstream_write, &activity, &closed, idle),
            copy_half(upstream_read, client_write, &activity, &closed, idle),
        );
        closed.cancel();
        counts
    };

    let watchdog = async {
        loop {
            let deadline = activity.last() + idle;
            tokio::select! {
                _ = closed.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    if activity.last().elapsed() >= idle {
                        debug!(?idle, "Flow idle, closing");
                        closed.cancel();
                        break;
                    }
                }
            }
        }
    };

    let (counts, ()) = tokio::join!(halves, watchdog);
    counts
}

/// Copy one direction. EOF half-closes the writer and leaves the other
/// direction running; a write that cannot make progress within `idle`
/// closes the whole flow.
async fn copy_half(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    activity: &Activity,
    closed: &CancellationToken,
    idle: Duration,
) -> u64 {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = tokio::select! {
            _ = closed.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        activity.touch();

        let written = tokio::select! {
            _ = closed.cancelled() => break,
            written = tokio::time::timeout(idle, writer.write_all(&buf[..n])) => written,
        };
        match written {
            Ok(Ok(())) => {
                copied += n as u64;
                activity.touch();
            }
            Ok(Err(_)) => {
                closed.cancel();
                break;
            }
            Err(_) => {
                debug!(?idle, "Peer stopped reading, closing flow");
                closed.cancel();
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    copied
}

/// Handle to a bound relay.
pub struct RelayHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, abort open flows and wait for the accept loop.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Relay task ended abnormally");
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
