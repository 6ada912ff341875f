//! Relay Client
//!
//! Private service addresses are only reachable through the tunnel relay that
//! runs next to each enclave. A tunnel asks the relay to open
//! `localPort:remoteIp:remotePort` and carries local TCP connections over it.
//!
//! Two transports are provided:
//! - `WebSocketConnector`: TCP-over-WebSocket to the relay. A long-lived
//!   control socket (`/control`) carries keep-alive pings, and every local
//!   connection gets its own binary socket (`/tunnel/{remote}`). An empty
//!   binary frame half-closes the stream towards the service; the relay
//!   sends `Close` once the service side is done.
//! - `DirectConnector`: dials the remote address directly. Useful when the
//!   portal itself runs inside the backend network.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Per-read buffer for relayed connections
const BRIDGE_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid remote spec '{0}'")]
    InvalidRemoteSpec(String),

    #[error("invalid relay URI '{0}'")]
    InvalidRelayUri(String),

    #[error("relay connection to {0} failed")]
    Connect(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("relay protocol error: {0}")]
    Protocol(String),

    #[error("relay connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::Protocol(err.to_string())
    }
}

/// The `localPort:remoteIp:remotePort` mapping requested from the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteSpec {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl RemoteSpec {
    pub fn new(
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Result<Self, RelayError> {
        let spec = Self {
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        };
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), RelayError> {
        let host = self.remote_host.as_str();
        let host_ok = if host.contains(':') {
            host.parse::<std::net::Ipv6Addr>().is_ok()
        } else {
            !host.is_empty()
                && host
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
        };
        if !host_ok || self.remote_port == 0 {
            return Err(RelayError::InvalidRemoteSpec(self.to_string()));
        }
        Ok(())
    }

    /// `remoteIp:remotePort`, bracketing IPv6 hosts
    pub fn remote_address(&self) -> String {
        if self.remote_host.contains(':') {
            format!("[{}]:{}", self.remote_host, self.remote_port)
        } else {
            format!("{}:{}", self.remote_host, self.remote_port)
        }
    }
}

impl fmt::Display for RemoteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local_port, self.remote_address())
    }
}

impl FromStr for RemoteSpec {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RelayError::InvalidRemoteSpec(s.to_string());

        let (local, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (host, remote) = rest.rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let local_port = local.parse::<u16>().map_err(|_| invalid())?;
        let remote_port = remote.parse::<u16>().map_err(|_| invalid())?;
        RemoteSpec::new(local_port, host, remote_port).map_err(|_| invalid())
    }
}

/// Byte counters shared by all connections of one tunnel
#[derive(Debug, Default)]
pub struct TrafficMeter {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TrafficMeter {
    pub fn record_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

/// Long-lived control channel to a relay
#[async_trait]
pub trait RelayControl: Send {
    /// Round-trip a keep-alive; an error means the channel is dead
    async fn ping(&mut self) -> Result<(), RelayError>;

    async fn close(&mut self);
}

/// Client side of one relay endpoint
#[async_trait]
pub trait RelayTransport: Send + Sync {
    fn relay_uri(&self) -> &str;

    /// Open the keep-alive control channel
    async fn connect(&self) -> Result<Box<dyn RelayControl>, RelayError>;

    /// Carry one local connection to `remote` until either side closes
    async fn bridge(
        &self,
        local: TcpStream,
        remote: &RemoteSpec,
        meter: &TrafficMeter,
    ) -> Result<(), RelayError>;
}

/// Builds transports for the relay URIs reported by the backend
pub trait RelayConnector: Send + Sync {
    fn transport_for(&self, relay_uri: &str) -> Result<Arc<dyn RelayTransport>, RelayError>;
}

// === WebSocket relay ===

/// Connector for TCP-over-WebSocket relays
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
    keepalive_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration, keepalive_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            keepalive_timeout,
        }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(10))
    }
}

impl RelayConnector for WebSocketConnector {
    fn transport_for(&self, relay_uri: &str) -> Result<Arc<dyn RelayTransport>, RelayError> {
        Ok(Arc::new(WebSocketRelay::new(
            relay_uri,
            self.connect_timeout,
            self.keepalive_timeout,
        )?))
    }
}

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketRelay {
    relay_uri: String,
    base_url: String,
    connect_timeout: Duration,
    keepalive_timeout: Duration,
}

impl WebSocketRelay {
    pub fn new(
        relay_uri: &str,
        connect_timeout: Duration,
        keepalive_timeout: Duration,
    ) -> Result<Self, RelayError> {
        Ok(Self {
            relay_uri: relay_uri.to_string(),
            base_url: websocket_base_url(relay_uri)?,
            connect_timeout,
            keepalive_timeout,
        })
    }

    async fn open(&self, path: &str) -> Result<RelaySocket, RelayError> {
        let url = format!("{}{}", self.base_url, path);
        match timeout(self.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(e)) => {
                debug!("WebSocket handshake with {} failed: {}", url, e);
                Err(RelayError::Connect(format!("{} ({})", self.relay_uri, e)))
            }
            Err(_) => Err(RelayError::Timeout(format!(
                "connecting to relay {} ({}s)",
                self.relay_uri,
                self.connect_timeout.as_secs()
            ))),
        }
    }
}

/// Map the relay URI the backend reports onto a `ws://` / `wss://` base URL
fn websocket_base_url(relay_uri: &str) -> Result<String, RelayError> {
    let trimmed = relay_uri.trim().trim_end_matches('/');
    let url = if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else if trimmed.contains("://") {
        return Err(RelayError::InvalidRelayUri(relay_uri.to_string()));
    } else {
        format!("ws://{}", trimmed)
    };

    match url.parse::<Uri>() {
        Ok(uri) if uri.host().is_some_and(|h| !h.is_empty()) => Ok(url),
        _ => Err(RelayError::InvalidRelayUri(relay_uri.to_string())),
    }
}

fn escape_path_segment(segment: &str) -> String {
    segment.replace('[', "%5B").replace(']', "%5D")
}

#[async_trait]
impl RelayTransport for WebSocketRelay {
    fn relay_uri(&self) -> &str {
        &self.relay_uri
    }

    async fn connect(&self) -> Result<Box<dyn RelayControl>, RelayError> {
        let socket = self.open("/control").await?;
        Ok(Box::new(WebSocketControl {
            socket,
            keepalive_timeout: self.keepalive_timeout,
            sequence: 0,
        }))
    }

    async fn bridge(
        &self,
        local: TcpStream,
        remote: &RemoteSpec,
        meter: &TrafficMeter,
    ) -> Result<(), RelayError> {
        let path = format!("/tunnel/{}", escape_path_segment(&remote.remote_address()));
        let socket = self.open(&path).await?;
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (mut local_read, mut local_write) = local.into_split();

        // Local -> relay. An empty binary frame marks local EOF; the socket
        // stays open so the reply can still arrive.
        let upstream = async {
            let mut buf = vec![0u8; BRIDGE_BUFFER_SIZE];
            loop {
                let n = local_read.read(&mut buf).await?;
                if n == 0 {
                    // Fails only if the relay already closed
                    let _ = ws_tx.send(Message::Binary(Vec::new())).await;
                    break;
                }
                ws_tx.send(Message::Binary(buf[..n].to_vec())).await?;
                meter.record_sent(n as u64);
            }
            Ok::<(), RelayError>(())
        };

        // Relay -> local, until the relay closes
        let downstream = async {
            while let Some(message) = ws_rx.next().await {
                match message? {
                    Message::Binary(data) => {
                        local_write.write_all(&data).await?;
                        meter.record_received(data.len() as u64);
                    }
                    Message::Close(_) => break,
                    _ => continue,
                }
            }
            let _ = local_write.shutdown().await;
            Ok::<(), RelayError>(())
        };

        tokio::try_join!(upstream, downstream).map(|_| ())
    }
}

struct WebSocketControl {
    socket: RelaySocket,
    keepalive_timeout: Duration,
    sequence: u64,
}

#[async_trait]
impl RelayControl for WebSocketControl {
    async fn ping(&mut self) -> Result<(), RelayError> {
        self.sequence = self.sequence.wrapping_add(1);
        let payload = self.sequence.to_be_bytes().to_vec();
        self.socket.send(Message::Ping(payload.clone())).await?;

        timeout(
            self.keepalive_timeout,
            wait_for_pong(&mut self.socket, &payload),
        )
        .await
        .map_err(|_| {
            RelayError::Timeout(format!(
                "no keep-alive response within {}s",
                self.keepalive_timeout.as_secs()
            ))
        })?
    }

    async fn close(&mut self) {
        let _ = self.socket.close(None).await;
    }
}

async fn wait_for_pong(socket: &mut RelaySocket, payload: &[u8]) -> Result<(), RelayError> {
    while let Some(message) = socket.next().await {
        match message? {
            Message::Pong(data) if data == payload => return Ok(()),
            Message::Close(_) => return Err(RelayError::Closed),
            _ => continue,
        }
    }
    Err(RelayError::Closed)
}

// === Direct dialing ===

/// Connector that bypasses the relay and dials services directly
#[derive(Debug, Clone)]
pub struct DirectConnector {
    connect_timeout: Duration,
}

impl DirectConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for DirectConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl RelayConnector for DirectConnector {
    fn transport_for(&self, relay_uri: &str) -> Result<Arc<dyn RelayTransport>, RelayError> {
        Ok(Arc::new(DirectRelay {
            relay_uri: relay_uri.to_string(),
            connect_timeout: self.connect_timeout,
        }))
    }
}

pub struct DirectRelay {
    relay_uri: String,
    connect_timeout: Duration,
}

struct DirectControl;

#[async_trait]
impl RelayControl for DirectControl {
    async fn ping(&mut self) -> Result<(), RelayError> {
        Ok(())
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl RelayTransport for DirectRelay {
    fn relay_uri(&self) -> &str {
        &self.relay_uri
    }

    async fn connect(&self) -> Result<Box<dyn RelayControl>, RelayError> {
        Ok(Box::new(DirectControl))
    }

    async fn bridge(
        &self,
        mut local: TcpStream,
        remote: &RemoteSpec,
        meter: &TrafficMeter,
    ) -> Result<(), RelayError> {
        let address = remote.remote_address();
        let mut upstream = timeout(self.connect_timeout, TcpStream::connect(address.as_str()))
            .await
            .map_err(|_| RelayError::Timeout(format!("connecting to {}", address)))?
            .map_err(|e| RelayError::Connect(format!("{} ({})", address, e)))?;
        let _ = upstream.set_nodelay(true);

        let (sent, received) = tokio::io::copy_bidirectional(&mut local, &mut upstream).await?;
        meter.record_sent(sent);
        meter.record_received(received);
        Ok(())
    }
}
