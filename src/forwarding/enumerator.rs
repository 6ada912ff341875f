//! Service Enumerator
//!
//! Resolves forwarding targets into dialable network locations by querying
//! the cluster backend. Nothing is cached: every call reflects the backend's
//! current view, so a restarted service is picked up with its new IP.

use std::sync::Arc;

use tracing::{debug, warn};

use super::target::{EnclaveServicePort, ServiceInterfaceDetail, TargetSpecifier};
use crate::backend::{ClusterBackend, EnclaveContext, ServiceContext, TransportProtocol};
use crate::error::PortalError;

pub struct ServiceEnumerator {
    backend: Arc<dyn ClusterBackend>,
}

impl ServiceEnumerator {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self { backend }
    }

    /// Resolve every (service, port) pair covered by `target`
    ///
    /// Results are ordered by service id, then port id.
    pub async fn collect_service_information(
        &self,
        target: &EnclaveServicePort,
    ) -> Result<Vec<ServiceInterfaceDetail>, PortalError> {
        let specifier = target.specifier()?;
        let enclave_id = specifier.enclave_id();

        let enclave = self.backend.get_enclave(enclave_id).await?;
        let relay_uri = enclave.relay_endpoint.ok_or_else(|| {
            PortalError::BackendUnavailable(format!(
                "enclave '{}' does not expose a tunnel relay endpoint",
                enclave_id
            ))
        })?;
        let enclave_ctx = self.backend.get_enclave_context(enclave_id).await?;

        let details = match &specifier {
            TargetSpecifier::Single(target) => {
                let service = enclave_ctx.get_service_context(target.service_id()).await?;
                let port = service.private_ports().get(target.port_id()).ok_or_else(|| {
                    PortalError::NotFound(format!(
                        "port '{}' does not exist on service '{}' in enclave '{}'",
                        target.port_id(),
                        target.service_id(),
                        target.enclave_id()
                    ))
                })?;
                if port.protocol != TransportProtocol::Tcp {
                    return Err(PortalError::InvalidArgument(format!(
                        "port '{}' uses {} but only TCP ports can be forwarded",
                        target,
                        port.protocol
                    )));
                }
                vec![ServiceInterfaceDetail::new(
                    target.clone(),
                    relay_uri,
                    service.private_ip_address(),
                    port.clone(),
                )]
            }
            TargetSpecifier::AllPortsOfService { service_id, .. } => {
                let service = enclave_ctx.get_service_context(service_id).await?;
                expand_ports(enclave_id, &relay_uri, &service)
            }
            TargetSpecifier::AllServicesOfEnclave { .. } => {
                self.expand_enclave(enclave_ctx.as_ref(), &relay_uri).await?
            }
        };

        debug!(
            "Resolved {} forwarding target(s) for {}",
            details.len(),
            target
        );
        Ok(details)
    }

    async fn expand_enclave(
        &self,
        enclave_ctx: &dyn EnclaveContext,
        relay_uri: &str,
    ) -> Result<Vec<ServiceInterfaceDetail>, PortalError> {
        let mut service_ids = enclave_ctx.get_service_ids().await?;
        service_ids.sort();

        let mut details = Vec::new();
        for service_id in service_ids {
            let service = enclave_ctx.get_service_context(&service_id).await?;
            details.extend(expand_ports(enclave_ctx.enclave_id(), relay_uri, &service));
        }
        Ok(details)
    }

    /// Lightweight backend round trip used as the subsystem liveness signal
    pub async fn check_health(&self) -> Result<(), PortalError> {
        self.backend
            .get_enclaves()
            .await
            .map(|_| ())
            .map_err(|e| PortalError::BackendUnavailable(e.to_string()))
    }
}

fn expand_ports(
    enclave_id: &str,
    relay_uri: &str,
    service: &ServiceContext,
) -> Vec<ServiceInterfaceDetail> {
    service
        .private_ports()
        .iter()
        .filter_map(|(port_id, spec)| {
            if spec.protocol != TransportProtocol::Tcp {
                warn!(
                    "Port '{}' of service '{}' uses {} and won't be forwarded, only TCP is supported",
                    port_id, service.service_id, spec.protocol
                );
                return None;
            }
            Some(ServiceInterfaceDetail::new(
                EnclaveServicePort::new(enclave_id, service.service_id.clone(), port_id.clone()),
                relay_uri,
                service.private_ip_address(),
                spec.clone(),
            ))
        })
        .collect()
}
