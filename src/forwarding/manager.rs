//! Port Forward Manager
//!
//! Entry point for forwarding requests. Validates the target, resolves it
//! through the `ServiceEnumerator` and opens or reuses tunnels through the
//! `TunnelSessionTracker`.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use super::enumerator::ServiceEnumerator;
use super::relay::RelayConnector;
use super::target::{EnclaveServicePort, ServiceInterfaceDetail};
use super::tracker::TunnelSessionTracker;
use super::tunnel::{TunnelConfig, TunnelInfo};
use crate::backend::ClusterBackend;
use crate::error::PortalError;

pub struct PortForwardManager {
    enumerator: ServiceEnumerator,
    tracker: TunnelSessionTracker,
}

impl PortForwardManager {
    pub fn new(
        backend: Arc<dyn ClusterBackend>,
        connector: Arc<dyn RelayConnector>,
        tunnel_config: TunnelConfig,
    ) -> Self {
        Self {
            enumerator: ServiceEnumerator::new(backend),
            tracker: TunnelSessionTracker::new(connector, tunnel_config),
        }
    }

    pub fn tracker(&self) -> &TunnelSessionTracker {
        &self.tracker
    }

    /// Forward every port covered by `target`
    ///
    /// With `requested_local_port` set, `target` must name a single port and
    /// the tunnel is bound to exactly that local port. With 0, each resolved
    /// port gets its own ephemeral local port. Either way the whole call
    /// succeeds or none of the tunnels it opened for untracked targets are
    /// kept.
    pub async fn create_user_service_port_forward(
        &self,
        target: &EnclaveServicePort,
        requested_local_port: u16,
    ) -> Result<HashMap<EnclaveServicePort, u16>, PortalError> {
        let specifier = target.specifier()?;
        if requested_local_port != 0 && !specifier.is_single() {
            return Err(PortalError::InvalidArgument(format!(
                "expected exactly one service for local port {}, found {}",
                requested_local_port, specifier
            )));
        }

        let details = self
            .enumerator
            .collect_service_information(target)
            .await
            .map_err(|e| e.context(format!("resolving {}", target)))?;

        if details.is_empty() {
            info!("Nothing to forward for {}", target);
            return Ok(HashMap::new());
        }

        if requested_local_port != 0 {
            self.forward_static(&details, requested_local_port).await
        } else {
            self.forward_ephemeral(&details).await
        }
    }

    async fn forward_static(
        &self,
        details: &[ServiceInterfaceDetail],
        local_port: u16,
    ) -> Result<HashMap<EnclaveServicePort, u16>, PortalError> {
        let [detail] = details else {
            return Err(PortalError::InvalidArgument(format!(
                "expected exactly one service for local port {}, found {}",
                local_port,
                details.len()
            )));
        };

        let port = self
            .tracker
            .create_and_open_port_forward(detail, local_port)
            .await
            .map_err(|e| e.context(format!("forwarding {} to local port {}", detail.target, local_port)))?;

        info!(
            "Forwarding {} on {}:{} -> {}:{}",
            detail.target,
            self.tracker.bind_address(),
            port,
            detail.service_ip,
            detail.port.number
        );
        Ok(HashMap::from([(detail.target.clone(), port)]))
    }

    async fn forward_ephemeral(
        &self,
        details: &[ServiceInterfaceDetail],
    ) -> Result<HashMap<EnclaveServicePort, u16>, PortalError> {
        let outcomes = join_all(
            details
                .iter()
                .map(|detail| self.tracker.ensure_port_forward(detail)),
        )
        .await;

        let mut forwarded = HashMap::with_capacity(details.len());
        let mut opened = Vec::new();
        let mut first_error = None;

        for (detail, outcome) in details.iter().zip(outcomes) {
            match outcome {
                Ok((port, forward)) => {
                    if let Some(id) = forward.opened() {
                        opened.push((&detail.target, id));
                    }
                    forwarded.insert(detail.target.clone(), port);
                }
                Err(e) => {
                    warn!("Failed to forward {}: {}", detail.target, e);
                    if first_error.is_none() {
                        first_error = Some(e.context(format!("forwarding {}", detail.target)));
                    }
                }
            }
        }

        if let Some(err) = first_error {
            let mut rolled_back = 0;
            for (target, id) in opened {
                if self.tracker.abandon(target, id).await {
                    rolled_back += 1;
                }
            }
            if rolled_back > 0 {
                info!("Rolled back {} tunnel(s) after a failed request", rolled_back);
            }
            return Err(err);
        }

        for (target, id) in opened {
            self.tracker.confirm(target, id).await;
        }
        let bind_address = self.tracker.bind_address();
        for (target, port) in &forwarded {
            info!("Forwarding {} on {}:{}", target, bind_address, port);
        }
        Ok(forwarded)
    }

    /// Stop the tunnel for one fully-qualified target
    ///
    /// Succeeds whether or not a tunnel existed.
    pub async fn remove_user_service_port_forward(
        &self,
        target: &EnclaveServicePort,
    ) -> Result<(), PortalError> {
        if !target.is_fully_qualified() {
            return Err(PortalError::InvalidArgument(format!(
                "stopping a port forward needs an enclave, service and port id, got '{}'",
                target
            )));
        }

        match self.tracker.stop_forwarding_port(target).await {
            0 => debug!("No port forward to stop for {}", target),
            n => info!("Stopped {} port forward(s) for {}", n, target),
        }
        Ok(())
    }

    /// Liveness of the forwarding subsystem, backed by a backend round trip
    pub async fn ping(&self) -> Result<(), PortalError> {
        self.enumerator.check_health().await
    }

    pub async fn list_port_forwards(&self) -> Vec<TunnelInfo> {
        self.tracker.list().await
    }

    pub async fn stop_all(&self) -> usize {
        let stopped = self.tracker.stop_all().await;
        info!("Stopped all port forwards ({} tunnel(s))", stopped);
        stopped
    }
}
