//! Tunnel Session Tracker
//!
//! Registry of live tunnels keyed by the fully-qualified forwarding target.
//! Every target has its own async slot lock, so concurrent requests for the
//! same target are serialized while different targets proceed in parallel.
//! A target never has more than one live tunnel.

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ports::allocate_ephemeral_port;
use super::relay::{RelayConnector, RelayTransport, RemoteSpec};
use super::target::{EnclaveServicePort, ServiceInterfaceDetail};
use super::tunnel::{PortForwardTunnel, TunnelConfig, TunnelInfo};
use crate::error::PortalError;

/// Attempts at binding a freshly allocated ephemeral port
const EPHEMERAL_BIND_ATTEMPTS: usize = 3;

/// What `ensure_port_forward` did for a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// A live tunnel already served the target
    Reused,
    /// The target had no usable tunnel. The new one stays provisional until
    /// `confirm` or `abandon` is called for it.
    Opened(Uuid),
    /// A stale tunnel (dead, or pointing at an old address) was swapped out
    Replaced(Uuid),
}

impl ForwardOutcome {
    /// Tunnel opened for an untracked target, if any
    pub fn opened(&self) -> Option<Uuid> {
        match self {
            ForwardOutcome::Opened(id) => Some(*id),
            _ => None,
        }
    }
}

struct TrackedTunnel {
    detail: ServiceInterfaceDetail,
    tunnel: PortForwardTunnel,
    /// Opened by an ensure call that has not committed yet
    provisional: bool,
}

impl TrackedTunnel {
    fn new(detail: &ServiceInterfaceDetail, tunnel: PortForwardTunnel, provisional: bool) -> Self {
        Self {
            detail: detail.clone(),
            tunnel,
            provisional,
        }
    }

    /// Live and still pointing at the same remote
    fn serves(&self, detail: &ServiceInterfaceDetail) -> bool {
        self.tunnel.is_running() && self.detail.same_remote(detail)
    }
}

type Slot = Arc<Mutex<Option<TrackedTunnel>>>;

pub struct TunnelSessionTracker {
    connector: Arc<dyn RelayConnector>,
    config: TunnelConfig,
    slots: DashMap<EnclaveServicePort, Slot>,
}

impl TunnelSessionTracker {
    pub fn new(connector: Arc<dyn RelayConnector>, config: TunnelConfig) -> Self {
        Self {
            connector,
            config,
            slots: DashMap::new(),
        }
    }

    /// Local address every tunnel is bound on
    pub fn bind_address(&self) -> IpAddr {
        self.config.bind_address
    }

    fn slot(&self, target: &EnclaveServicePort) -> Slot {
        self.slots.entry(target.clone()).or_default().clone()
    }

    /// Drop the entry for `target` once its slot is empty and unshared.
    /// Callers must have released their own handle on the slot.
    fn release_slot(&self, target: &EnclaveServicePort) {
        self.slots.remove_if(target, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|guard| guard.is_none())
        });
    }

    /// Snapshot of slots in scope; the map is never held across an await
    fn slots_matching(&self, scope: Option<&EnclaveServicePort>) -> Vec<(EnclaveServicePort, Slot)> {
        self.slots
            .iter()
            .filter(|entry| scope.map_or(true, |scope| entry.key().matches(scope)))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn transport_for(
        &self,
        detail: &ServiceInterfaceDetail,
    ) -> Result<Arc<dyn RelayTransport>, PortalError> {
        self.connector
            .transport_for(&detail.chisel_server_uri)
            .map_err(|e| {
                PortalError::TunnelStartFailure(format!(
                    "could not create relay client for {}: {}",
                    detail.target, e
                ))
            })
    }

    async fn open(
        &self,
        transport: Arc<dyn RelayTransport>,
        detail: &ServiceInterfaceDetail,
        local_port: u16,
    ) -> Result<PortForwardTunnel, PortalError> {
        let mut tunnel =
            PortForwardTunnel::new(local_port, detail, transport, self.config.clone());
        tunnel.run_async().await?;
        Ok(tunnel)
    }

    /// Open a tunnel for `detail` on an explicit local port
    ///
    /// A live tunnel for the same target, remote and port is reused. Any other
    /// tunnel tracked for the target is replaced; when the new tunnel fails to
    /// start the previous one is left in place, unless it had to be stopped
    /// first to free the same local port.
    pub async fn create_and_open_port_forward(
        &self,
        detail: &ServiceInterfaceDetail,
        local_port: u16,
    ) -> Result<u16, PortalError> {
        let result = self.create_in_slot(detail, local_port).await;
        if result.is_err() {
            self.release_slot(&detail.target);
        }
        result
    }

    async fn create_in_slot(
        &self,
        detail: &ServiceInterfaceDetail,
        local_port: u16,
    ) -> Result<u16, PortalError> {
        let slot = self.slot(&detail.target);
        let mut guard = slot.lock().await;

        if let Some(existing) = guard.as_mut() {
            if existing.serves(detail) && existing.tunnel.local_port() == local_port {
                debug!(
                    "Reusing tunnel {} for {} on port {}",
                    existing.tunnel.id(),
                    detail.target,
                    local_port
                );
                existing.provisional = false;
                return Ok(local_port);
            }
        }

        let transport = self.transport_for(detail)?;

        let mut previous = guard.take();
        if let Some(tracked) = previous.as_mut() {
            if tracked.tunnel.local_port() == local_port {
                info!(
                    "Stopping tunnel {} for {} to rebind port {}",
                    tracked.tunnel.id(),
                    detail.target,
                    local_port
                );
                tracked.tunnel.stop().await;
                previous = None;
            }
        }

        match self.open(transport, detail, local_port).await {
            Ok(tunnel) => {
                let port = tunnel.local_port();
                if let Some(mut old) = previous {
                    info!(
                        "Replacing tunnel {} for {} (port {})",
                        old.tunnel.id(),
                        detail.target,
                        old.tunnel.local_port()
                    );
                    old.tunnel.stop().await;
                }
                *guard = Some(TrackedTunnel::new(detail, tunnel, false));
                Ok(port)
            }
            Err(e) => {
                *guard = previous;
                Err(e)
            }
        }
    }

    /// Make sure `detail` is forwarded on some ephemeral local port
    ///
    /// Returns the local port and what had to be done to get it.
    pub async fn ensure_port_forward(
        &self,
        detail: &ServiceInterfaceDetail,
    ) -> Result<(u16, ForwardOutcome), PortalError> {
        let result = self.ensure_in_slot(detail).await;
        if result.is_err() {
            self.release_slot(&detail.target);
        }
        result
    }

    async fn ensure_in_slot(
        &self,
        detail: &ServiceInterfaceDetail,
    ) -> Result<(u16, ForwardOutcome), PortalError> {
        let slot = self.slot(&detail.target);
        let mut guard = slot.lock().await;

        if let Some(existing) = guard.as_mut() {
            if existing.serves(detail) {
                debug!(
                    "{} already forwarded on port {}",
                    detail.target,
                    existing.tunnel.local_port()
                );
                existing.provisional = false;
                return Ok((existing.tunnel.local_port(), ForwardOutcome::Reused));
            }
        }

        let transport = self.transport_for(detail)?;
        // Only binding is worth retrying
        RemoteSpec::new(0, detail.service_ip.clone(), detail.port.number).map_err(|e| {
            PortalError::TunnelStartFailure(format!("{} for {}", e, detail.target))
        })?;
        let previous = guard.take();

        let mut last_error = None;
        for attempt in 1..=EPHEMERAL_BIND_ATTEMPTS {
            let local_port = match allocate_ephemeral_port(self.config.bind_address) {
                Ok(port) => port,
                Err(e) => {
                    *guard = previous;
                    return Err(e);
                }
            };

            match self.open(transport.clone(), detail, local_port).await {
                Ok(tunnel) => {
                    let id = tunnel.id();
                    let port = tunnel.local_port();
                    let outcome = match previous {
                        Some(mut old) => {
                            info!(
                                "Replacing tunnel {} for {} (remote changed)",
                                old.tunnel.id(),
                                detail.target
                            );
                            old.tunnel.stop().await;
                            ForwardOutcome::Replaced(id)
                        }
                        None => ForwardOutcome::Opened(id),
                    };
                    let provisional = matches!(outcome, ForwardOutcome::Opened(_));
                    *guard = Some(TrackedTunnel::new(detail, tunnel, provisional));
                    return Ok((port, outcome));
                }
                Err(e) => {
                    warn!(
                        "Attempt {}/{} to forward {} on port {} failed: {}",
                        attempt, EPHEMERAL_BIND_ATTEMPTS, detail.target, local_port, e
                    );
                    last_error = Some(e);
                }
            }
        }

        *guard = previous;
        Err(last_error.unwrap_or_else(|| {
            PortalError::PortAllocationFailure(format!("no local port for {}", detail.target))
        }))
    }

    /// Keep a tunnel reported as `ForwardOutcome::Opened`
    pub async fn confirm(&self, target: &EnclaveServicePort, tunnel_id: Uuid) {
        let Some(slot) = self.slots.get(target).map(|entry| entry.value().clone()) else {
            return;
        };
        if let Some(tracked) = slot.lock().await.as_mut() {
            if tracked.tunnel.id() == tunnel_id {
                tracked.provisional = false;
            }
        };
    }

    /// Stop a tunnel reported as `ForwardOutcome::Opened`
    ///
    /// Does nothing once the slot holds another tunnel or another caller has
    /// reused this one. Returns whether the tunnel was stopped.
    pub async fn abandon(&self, target: &EnclaveServicePort, tunnel_id: Uuid) -> bool {
        let Some(slot) = self.slots.get(target).map(|entry| entry.value().clone()) else {
            return false;
        };

        let stopped = {
            let mut guard = slot.lock().await;
            let owned = guard
                .as_ref()
                .is_some_and(|tracked| tracked.provisional && tracked.tunnel.id() == tunnel_id);
            let abandoned = if owned { guard.take() } else { None };
            match abandoned {
                Some(mut tracked) => {
                    tracked.tunnel.stop().await;
                    debug!("Abandoned tunnel {} for {}", tunnel_id, target);
                    true
                }
                None => false,
            }
        };

        drop(slot);
        self.release_slot(target);
        stopped
    }

    /// Stop every tunnel whose target falls inside `scope`
    ///
    /// Returns how many tunnels were stopped; zero is not an error.
    pub async fn stop_forwarding_port(&self, scope: &EnclaveServicePort) -> usize {
        self.stop_slots(self.slots_matching(Some(scope))).await
    }

    pub async fn stop_all(&self) -> usize {
        self.stop_slots(self.slots_matching(None)).await
    }

    async fn stop_slots(&self, slots: Vec<(EnclaveServicePort, Slot)>) -> usize {
        let mut stopped = 0;
        for (target, slot) in slots {
            {
                let mut guard = slot.lock().await;
                if let Some(mut tracked) = guard.take() {
                    tracked.tunnel.stop().await;
                    info!(
                        "Stopped forwarding {} (local port {})",
                        target,
                        tracked.tunnel.local_port()
                    );
                    stopped += 1;
                }
            }
            drop(slot);
            self.release_slot(&target);
        }
        stopped
    }

    pub async fn lookup(&self, target: &EnclaveServicePort) -> Option<TunnelInfo> {
        let slot = self.slots.get(target)?.value().clone();
        let guard = slot.lock().await;
        guard.as_ref().map(|tracked| tracked.tunnel.info())
    }

    /// All tracked tunnels, ordered by target
    pub async fn list(&self) -> Vec<TunnelInfo> {
        let mut slots = self.slots_matching(None);
        slots.sort_by(|a, b| a.0.cmp(&b.0));

        let mut tunnels = Vec::with_capacity(slots.len());
        for (_, slot) in slots {
            if let Some(tracked) = slot.lock().await.as_ref() {
                tunnels.push(tracked.tunnel.info());
            }
        }
        tunnels
    }

    pub async fn count(&self) -> usize {
        let mut count = 0;
        for (_, slot) in self.slots_matching(None) {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PortSpec;
    use crate::forwarding::relay::DirectConnector;
    use crate::forwarding::test_support::spawn_echo_server;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn tracker() -> TunnelSessionTracker {
        TunnelSessionTracker::new(Arc::new(DirectConnector::default()), TunnelConfig::default())
    }

    fn detail(service: &str, port_id: &str, ip: &str, port: u16) -> ServiceInterfaceDetail {
        ServiceInterfaceDetail::new(
            EnclaveServicePort::new("e1", service, port_id),
            "10.1.0.2:9501",
            ip,
            PortSpec::tcp(port),
        )
    }

    fn free_port() -> u16 {
        allocate_ephemeral_port("127.0.0.1".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_bind_address_follows_config() {
        assert_eq!(tracker().bind_address().to_string(), "127.0.0.1");

        let config = TunnelConfig {
            bind_address: "::1".parse().unwrap(),
            ..TunnelConfig::default()
        };
        let tracker = TunnelSessionTracker::new(Arc::new(DirectConnector::default()), config);
        assert_eq!(tracker.bind_address().to_string(), "::1");
    }

    #[tokio::test]
    async fn test_create_registers_and_stop_removes() {
        let tracker = tracker();
        let d = detail("svc-a", "http", "10.0.0.5", 8080);
        let port = free_port();

        assert_eq!(tracker.create_and_open_port_forward(&d, port).await.unwrap(), port);
        let info = tracker.lookup(&d.target).await.unwrap();
        assert_eq!(info.local_port, port);
        assert_eq!(info.remote_host, "10.0.0.5");
        assert_eq!(tracker.count().await, 1);

        assert_eq!(tracker.stop_forwarding_port(&d.target).await, 1);
        assert!(tracker.lookup(&d.target).await.is_none());
        assert_eq!(tracker.stop_forwarding_port(&d.target).await, 0);
        assert_eq!(tracker.count().await, 0);
    }

    #[tokio::test]
    async fn test_identical_request_is_reused() {
        let tracker = tracker();
        let d = detail("svc-a", "http", "10.0.0.5", 8080);
        let port = free_port();

        tracker.create_and_open_port_forward(&d, port).await.unwrap();
        let first = tracker.lookup(&d.target).await.unwrap().id;
        tracker.create_and_open_port_forward(&d, port).await.unwrap();
        assert_eq!(tracker.lookup(&d.target).await.unwrap().id, first);
        assert_eq!(tracker.count().await, 1);
    }

    #[tokio::test]
    async fn test_new_remote_replaces_tunnel() {
        let tracker = tracker();
        let before = detail("svc-a", "http", "10.0.0.5", 8080);
        let after = detail("svc-a", "http", "10.0.0.9", 8080);
        let port = free_port();

        tracker.create_and_open_port_forward(&before, port).await.unwrap();
        tracker.create_and_open_port_forward(&after, port).await.unwrap();

        let info = tracker.lookup(&after.target).await.unwrap();
        assert_eq!(info.remote_host, "10.0.0.9");
        assert_eq!(info.local_port, port);
        assert_eq!(tracker.count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_replacement_keeps_previous() {
        let tracker = tracker();
        let d = detail("svc-a", "http", "10.0.0.5", 8080);
        let port = free_port();
        tracker.create_and_open_port_forward(&d, port).await.unwrap();

        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = occupied.local_addr().unwrap().port();
        assert!(tracker.create_and_open_port_forward(&d, busy).await.is_err());

        assert_eq!(tracker.lookup(&d.target).await.unwrap().local_port, port);
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let tracker = tracker();
        let d = detail("svc-a", "http", "10.0.0.5", 8080);

        let (port, outcome) = tracker.ensure_port_forward(&d).await.unwrap();
        assert!(outcome.opened().is_some());
        assert_ne!(port, 0);
        assert_eq!(
            tracker.ensure_port_forward(&d).await.unwrap(),
            (port, ForwardOutcome::Reused)
        );
    }

    #[tokio::test]
    async fn test_changed_remote_is_reported_as_replaced() {
        let tracker = tracker();
        let before = detail("svc-a", "http", "10.0.0.5", 8080);
        let after = detail("svc-a", "http", "10.0.0.9", 8080);

        let (_, opened) = tracker.ensure_port_forward(&before).await.unwrap();
        let (_, replaced) = tracker.ensure_port_forward(&after).await.unwrap();

        let ForwardOutcome::Replaced(id) = replaced else {
            panic!("expected a replacement, got {:?}", replaced);
        };
        assert_ne!(Some(id), opened.opened());
        assert_eq!(tracker.lookup(&after.target).await.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_abandon_stops_only_unclaimed_tunnel() {
        let tracker = tracker();
        let d = detail("svc-a", "http", "10.0.0.5", 8080);

        let (_, outcome) = tracker.ensure_port_forward(&d).await.unwrap();
        let id = outcome.opened().unwrap();
        // A second caller picks the tunnel up before the first one gives up
        assert_eq!(tracker.ensure_port_forward(&d).await.unwrap().1, ForwardOutcome::Reused);
        assert!(!tracker.abandon(&d.target, id).await);
        assert_eq!(tracker.lookup(&d.target).await.unwrap().id, id);

        tracker.stop_all().await;
        let (_, outcome) = tracker.ensure_port_forward(&d).await.unwrap();
        let id = outcome.opened().unwrap();
        assert!(!tracker.abandon(&d.target, Uuid::new_v4()).await);
        assert!(tracker.abandon(&d.target, id).await);
        assert!(tracker.lookup(&d.target).await.is_none());
        assert!(tracker.slots.is_empty());
    }

    #[tokio::test]
    async fn test_confirmed_tunnel_survives_abandon() {
        let tracker = tracker();
        let d = detail("svc-a", "http", "10.0.0.5", 8080);

        let (_, outcome) = tracker.ensure_port_forward(&d).await.unwrap();
        let id = outcome.opened().unwrap();
        tracker.confirm(&d.target, id).await;
        assert!(!tracker.abandon(&d.target, id).await);
        assert_eq!(tracker.count().await, 1);
    }

    #[tokio::test]
    async fn test_slots_are_released_after_stop_and_failure() {
        let tracker = tracker();
        for round in 0..50 {
            let d = detail(&format!("svc-{}", round), "http", "10.0.0.5", 8080);
            tracker.ensure_port_forward(&d).await.unwrap();
            assert_eq!(tracker.stop_forwarding_port(&d.target).await, 1);
        }
        assert_eq!(tracker.count().await, 0);
        assert!(tracker.slots.is_empty());

        let bad = detail("svc-bad", "http", "not a host", 80);
        assert!(tracker.ensure_port_forward(&bad).await.is_err());
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = occupied.local_addr().unwrap().port();
        let d = detail("svc-a", "http", "10.0.0.5", 8080);
        assert!(tracker.create_and_open_port_forward(&d, busy).await.is_err());
        assert!(tracker.slots.is_empty());
    }

    #[tokio::test]
    async fn test_scope_stop() {
        let tracker = tracker();
        for d in [
            detail("svc-a", "http", "10.0.0.5", 8080),
            detail("svc-b", "grpc", "10.0.0.6", 9090),
            detail("svc-b", "metrics", "10.0.0.6", 9100),
        ] {
            tracker.ensure_port_forward(&d).await.unwrap();
        }

        let stopped = tracker
            .stop_forwarding_port(&EnclaveServicePort::service("e1", "svc-b"))
            .await;
        assert_eq!(stopped, 2);

        let remaining: Vec<String> = tracker
            .list()
            .await
            .iter()
            .map(|t| t.target.to_string())
            .collect();
        assert_eq!(remaining, vec!["e1/svc-a/http"]);
        assert_eq!(tracker.stop_all().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_opens_one_tunnel() {
        let tracker = Arc::new(tracker());
        let d = detail("svc-a", "http", "10.0.0.5", 8080);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                let d = d.clone();
                tokio::spawn(async move { tracker.ensure_port_forward(&d).await.unwrap() })
            })
            .collect();

        let mut ports = Vec::new();
        let mut created = 0;
        for handle in handles {
            let (port, outcome) = handle.await.unwrap();
            ports.push(port);
            if outcome.opened().is_some() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        ports.dedup();
        assert_eq!(ports.len(), 1);
    }

    #[tokio::test]
    async fn test_forwarded_port_reaches_service() {
        let echo = spawn_echo_server().await;
        let tracker = tracker();
        let d = detail("svc-a", "http", "127.0.0.1", echo.port());
        let (port, _) = tracker.ensure_port_forward(&d).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
