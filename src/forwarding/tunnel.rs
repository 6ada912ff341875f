//! Tunnel Session
//!
//! A `PortForwardTunnel` binds one local TCP port and carries every
//! connection accepted on it through the enclave relay to a single private
//! service address (`localPort:remoteIp:remotePort`).
//!
//! `run_async` only binds the port and schedules the session task; the relay
//! connection is established (and re-established, forever by default) in the
//! background. The session lives until it is cancelled, stopped or dropped.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::relay::{RelayTransport, RemoteSpec, TrafficMeter};
use super::retry::RetryPolicy;
use super::target::{EnclaveServicePort, ServiceInterfaceDetail};
use crate::error::PortalError;

/// Tunnel session settings
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Local address the forwarded ports are bound on
    pub bind_address: IpAddr,
    /// Interval between relay keep-alive pings
    pub keepalive_interval: Duration,
    /// Reconnect policy for the relay control connection
    pub retry: RetryPolicy,
    /// How long `stop` waits for the session task to exit
    pub stop_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            keepalive_interval: Duration::from_secs(25),
            retry: RetryPolicy::default(),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Relay connection state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    /// Local port bound, first relay connection in progress
    Starting,
    /// Relay connection up
    Connected,
    /// Relay connection lost, retrying
    Reconnecting,
    /// Session ended
    Stopped,
}

/// Statistics for a tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStats {
    pub connection_count: u64,
    pub active_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnect_count: u64,
}

/// Snapshot of a tunnel for listings and the control API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub id: Uuid,
    pub target: EnclaveServicePort,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub relay_uri: String,
    pub status: TunnelStatus,
    pub stats: TunnelStats,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SessionCounters {
    connection_count: AtomicU64,
    active_connections: AtomicU64,
    reconnect_count: AtomicU64,
    traffic: TrafficMeter,
}

impl SessionCounters {
    fn snapshot(&self) -> TunnelStats {
        TunnelStats {
            connection_count: self.connection_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.traffic.bytes_sent(),
            bytes_received: self.traffic.bytes_received(),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
        }
    }
}

/// One running local port <-> remote service forwarding session
pub struct PortForwardTunnel {
    id: Uuid,
    detail: ServiceInterfaceDetail,
    local_port: u16,
    transport: Arc<dyn RelayTransport>,
    config: TunnelConfig,
    cancel: CancellationToken,
    status: Arc<watch::Sender<TunnelStatus>>,
    counters: Arc<SessionCounters>,
    task: Option<JoinHandle<()>>,
    created_at: DateTime<Utc>,
}

impl PortForwardTunnel {
    pub fn new(
        local_port: u16,
        detail: &ServiceInterfaceDetail,
        transport: Arc<dyn RelayTransport>,
        config: TunnelConfig,
    ) -> Self {
        let (status, _) = watch::channel(TunnelStatus::Starting);
        Self {
            id: Uuid::new_v4(),
            detail: detail.clone(),
            local_port,
            transport,
            config,
            cancel: CancellationToken::new(),
            status: Arc::new(status),
            counters: Arc::new(SessionCounters::default()),
            task: None,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn detail(&self) -> &ServiceInterfaceDetail {
        &self.detail
    }

    /// Bound local port (the requested one until `run_async` resolves port 0)
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_spec(&self) -> Result<RemoteSpec, PortalError> {
        RemoteSpec::new(
            self.local_port,
            self.detail.service_ip.clone(),
            self.detail.port.number,
        )
        .map_err(|e| {
            PortalError::TunnelStartFailure(format!("{} for {}", e, self.detail.target))
        })
    }

    /// Bind the local port and start the session in the background
    ///
    /// Returns the bound local port. Relay connection failures after this
    /// point are retried by the session and never reported here.
    pub async fn run_async(&mut self) -> Result<u16, PortalError> {
        if self.task.is_some() || self.cancel.is_cancelled() {
            return Err(PortalError::TunnelStartFailure(format!(
                "tunnel {} for {} has already been started",
                self.id, self.detail.target
            )));
        }

        let remote = self.remote_spec()?;
        let bind_addr = SocketAddr::new(self.config.bind_address, self.local_port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| bind_error(bind_addr, &self.detail.target, e))?;
        let bound_port = listener
            .local_addr()
            .map_err(|e| {
                PortalError::TunnelStartFailure(format!("failed to get bound address: {}", e))
            })?
            .port();
        self.local_port = bound_port;
        let remote = RemoteSpec {
            local_port: bound_port,
            ..remote
        };

        info!(
            "Starting tunnel {} for {}: {} via relay {}",
            self.id,
            self.detail.target,
            remote,
            self.transport.relay_uri()
        );

        let session = TunnelSession {
            id: self.id,
            remote: Arc::new(remote),
            transport: self.transport.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
            status: self.status.clone(),
            counters: self.counters.clone(),
        };
        self.task = Some(tokio::spawn(session.run(listener)));

        Ok(bound_port)
    }

    /// Request the session to end; safe to call any number of times
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Cancelling tunnel {}", self.id);
        }
        self.cancel.cancel();
    }

    /// Cancel and wait for the session task so the local port is released
    pub async fn stop(&mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            match tokio::time::timeout(self.config.stop_timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Tunnel {} task ended abnormally: {}", self.id, e),
                Err(_) => warn!(
                    "Tunnel {} did not stop within {}s",
                    self.id,
                    self.config.stop_timeout.as_secs()
                ),
            }
        }
        self.status.send_replace(TunnelStatus::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some() && !self.cancel.is_cancelled() && self.status() != TunnelStatus::Stopped
    }

    pub fn status(&self) -> TunnelStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<TunnelStatus> {
        self.status.subscribe()
    }

    pub fn stats(&self) -> TunnelStats {
        self.counters.snapshot()
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            id: self.id,
            target: self.detail.target.clone(),
            local_port: self.local_port,
            remote_host: self.detail.service_ip.clone(),
            remote_port: self.detail.port.number,
            relay_uri: self.detail.chisel_server_uri.clone(),
            status: self.status(),
            stats: self.stats(),
            created_at: self.created_at,
        }
    }
}

impl Drop for PortForwardTunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn bind_error(addr: SocketAddr, target: &EnclaveServicePort, e: std::io::Error) -> PortalError {
    let message = match e.kind() {
        std::io::ErrorKind::AddrInUse => format!(
            "port already in use: {} (forwarding {}). Another application may be using this port.",
            addr, target
        ),
        std::io::ErrorKind::PermissionDenied => format!(
            "permission denied binding to {} (forwarding {}). Ports below 1024 require elevated privileges.",
            addr, target
        ),
        std::io::ErrorKind::AddrNotAvailable => format!(
            "address not available: {} (forwarding {}). The address is not valid on this system.",
            addr, target
        ),
        _ => format!("failed to bind to {} (forwarding {}): {}", addr, target, e),
    };
    PortalError::TunnelStartFailure(message)
}

/// State moved into the background task
struct TunnelSession {
    id: Uuid,
    remote: Arc<RemoteSpec>,
    transport: Arc<dyn RelayTransport>,
    config: TunnelConfig,
    cancel: CancellationToken,
    status: Arc<watch::Sender<TunnelStatus>>,
    counters: Arc<SessionCounters>,
}

impl TunnelSession {
    async fn run(self, listener: TcpListener) {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                info!("Tunnel {} stopped by request", self.id);
            }
            _ = self.maintain_relay_connection() => {
                error!("Tunnel {} gave up reconnecting to relay {}", self.id, self.transport.relay_uri());
            }
            _ = self.accept_connections(&listener) => {}
        }

        // Tear down in-flight connections too
        self.cancel.cancel();
        self.status.send_replace(TunnelStatus::Stopped);
        info!("Tunnel {} task exited", self.id);
    }

    /// Keep a control connection to the relay alive; returns only when the
    /// retry policy is exhausted
    async fn maintain_relay_connection(&self) {
        let mut failures: u32 = 0;
        loop {
            match self.transport.connect().await {
                Ok(mut control) => {
                    failures = 0;
                    self.status.send_replace(TunnelStatus::Connected);
                    info!(
                        "Tunnel {} connected to relay {}",
                        self.id,
                        self.transport.relay_uri()
                    );

                    let period = self.config.keepalive_interval.max(Duration::from_millis(10));
                    let mut keepalive = tokio::time::interval(period);
                    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    keepalive.tick().await;
                    let err = loop {
                        keepalive.tick().await;
                        if let Err(e) = control.ping().await {
                            break e;
                        }
                    };
                    warn!(
                        "Tunnel {} lost relay {}: {}",
                        self.id,
                        self.transport.relay_uri(),
                        err
                    );
                    control.close().await;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(
                        "Tunnel {} could not reach relay {} (attempt {}): {}",
                        self.id,
                        self.transport.relay_uri(),
                        failures,
                        e
                    );
                }
            }

            if !self.config.retry.should_retry(failures) {
                return;
            }
            self.status.send_replace(TunnelStatus::Reconnecting);
            self.counters.reconnect_count.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(self.config.retry.delay_for(failures.saturating_sub(1))).await;
        }
    }

    async fn accept_connections(&self, listener: &TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {}", e);
                    }
                    debug!(
                        "Tunnel {} accepted connection from {} for {}",
                        self.id,
                        peer_addr,
                        self.remote.remote_address()
                    );

                    self.counters.connection_count.fetch_add(1, Ordering::Relaxed);
                    self.counters.active_connections.fetch_add(1, Ordering::Relaxed);

                    let transport = self.transport.clone();
                    let remote = self.remote.clone();
                    let counters = self.counters.clone();
                    let token = self.cancel.child_token();
                    let tunnel_id = self.id;

                    tokio::spawn(async move {
                        let result = tokio::select! {
                            _ = token.cancelled() => Ok(()),
                            result = transport.bridge(stream, &remote, &counters.traffic) => result,
                        };
                        counters.active_connections.fetch_sub(1, Ordering::Relaxed);

                        match result {
                            Ok(()) => debug!("Tunnel {} connection from {} closed", tunnel_id, peer_addr),
                            Err(e) => warn!(
                                "Tunnel {} connection from {} to {} failed: {}",
                                tunnel_id,
                                peer_addr,
                                remote.remote_address(),
                                e
                            ),
                        }
                    });
                }
                Err(e) => {
                    error!("Tunnel {} accept error: {}", self.id, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}
