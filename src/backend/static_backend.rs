//! Static Cluster Backend
//!
//! Serves enclaves and services from a fixed topology, loaded from a JSON
//! file or built in memory. Services can be updated at runtime to mirror a
//! restart that moves a service to a new private IP.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::types::{EnclaveInfo, PortSpec, ServiceContext};
use super::{BackendError, ClusterBackend, EnclaveContext};

/// Topology file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    #[serde(default)]
    pub enclaves: Vec<EnclaveTopology>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnclaveTopology {
    pub enclave_id: String,
    #[serde(default)]
    pub name: String,
    /// `host:port` of the tunnel relay next to the enclave
    #[serde(default)]
    pub relay_endpoint: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceTopology>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTopology {
    pub service_id: String,
    pub private_ip_address: String,
    #[serde(default)]
    pub ports: BTreeMap<String, PortSpec>,
}

impl Topology {
    /// Read a topology from a JSON file
    pub async fn from_json_file(path: &Path) -> std::io::Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl EnclaveTopology {
    pub fn new(enclave_id: impl Into<String>, relay_endpoint: impl Into<String>) -> Self {
        let enclave_id = enclave_id.into();
        Self {
            name: enclave_id.clone(),
            enclave_id,
            relay_endpoint: Some(relay_endpoint.into()),
            services: Vec::new(),
        }
    }

    pub fn with_service(mut self, service: ServiceTopology) -> Self {
        self.services.push(service);
        self
    }

    fn info(&self) -> EnclaveInfo {
        EnclaveInfo {
            enclave_id: self.enclave_id.clone(),
            name: self.name.clone(),
            relay_endpoint: self.relay_endpoint.clone(),
        }
    }
}

impl ServiceTopology {
    pub fn new(service_id: impl Into<String>, private_ip_address: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            private_ip_address: private_ip_address.into(),
            ports: BTreeMap::new(),
        }
    }

    pub fn with_port(mut self, port_id: impl Into<String>, spec: PortSpec) -> Self {
        self.ports.insert(port_id.into(), spec);
        self
    }

    fn context(&self) -> ServiceContext {
        ServiceContext {
            service_id: self.service_id.clone(),
            private_ip_address: self.private_ip_address.clone(),
            private_ports: self.ports.clone(),
        }
    }
}

type EnclaveMap = BTreeMap<String, EnclaveTopology>;

/// In-memory backend over a `Topology`
#[derive(Clone, Default)]
pub struct StaticClusterBackend {
    enclaves: Arc<RwLock<EnclaveMap>>,
}

impl StaticClusterBackend {
    pub fn new(topology: Topology) -> Self {
        let enclaves = topology
            .enclaves
            .into_iter()
            .map(|enclave| (enclave.enclave_id.clone(), enclave))
            .collect();
        Self {
            enclaves: Arc::new(RwLock::new(enclaves)),
        }
    }

    /// Insert or replace a service inside an existing enclave
    pub fn upsert_service(
        &self,
        enclave_id: &str,
        service: ServiceTopology,
    ) -> Result<(), BackendError> {
        let mut enclaves = self.enclaves.write();
        let enclave = enclaves
            .get_mut(enclave_id)
            .ok_or_else(|| BackendError::EnclaveNotFound(enclave_id.to_string()))?;
        enclave.services.retain(|s| s.service_id != service.service_id);
        enclave.services.push(service);
        Ok(())
    }

    /// Drop a service, as when it is removed from its enclave
    pub fn remove_service(&self, enclave_id: &str, service_id: &str) -> bool {
        let mut enclaves = self.enclaves.write();
        match enclaves.get_mut(enclave_id) {
            Some(enclave) => {
                let before = enclave.services.len();
                enclave.services.retain(|s| s.service_id != service_id);
                enclave.services.len() != before
            }
            None => false,
        }
    }
}

#[async_trait]
impl ClusterBackend for StaticClusterBackend {
    async fn get_enclave(&self, enclave_id: &str) -> Result<EnclaveInfo, BackendError> {
        self.enclaves
            .read()
            .get(enclave_id)
            .map(EnclaveTopology::info)
            .ok_or_else(|| BackendError::EnclaveNotFound(enclave_id.to_string()))
    }

    async fn get_enclave_context(
        &self,
        enclave_id: &str,
    ) -> Result<Arc<dyn EnclaveContext>, BackendError> {
        if !self.enclaves.read().contains_key(enclave_id) {
            return Err(BackendError::EnclaveNotFound(enclave_id.to_string()));
        }
        Ok(Arc::new(StaticEnclaveContext {
            enclave_id: enclave_id.to_string(),
            enclaves: self.enclaves.clone(),
        }))
    }

    async fn get_enclaves(&self) -> Result<Vec<EnclaveInfo>, BackendError> {
        Ok(self
            .enclaves
            .read()
            .values()
            .map(EnclaveTopology::info)
            .collect())
    }
}

/// Live view of one enclave; reflects later topology updates
struct StaticEnclaveContext {
    enclave_id: String,
    enclaves: Arc<RwLock<EnclaveMap>>,
}

impl StaticEnclaveContext {
    fn with_enclave<T>(
        &self,
        f: impl FnOnce(&EnclaveTopology) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let enclaves = self.enclaves.read();
        let enclave = enclaves
            .get(&self.enclave_id)
            .ok_or_else(|| BackendError::EnclaveNotFound(self.enclave_id.clone()))?;
        f(enclave)
    }
}

#[async_trait]
impl EnclaveContext for StaticEnclaveContext {
    fn enclave_id(&self) -> &str {
        &self.enclave_id
    }

    async fn get_service_context(&self, service_id: &str) -> Result<ServiceContext, BackendError> {
        self.with_enclave(|enclave| {
            enclave
                .services
                .iter()
                .find(|s| s.service_id == service_id)
                .map(ServiceTopology::context)
                .ok_or_else(|| BackendError::ServiceNotFound {
                    enclave_id: self.enclave_id.clone(),
                    service_id: service_id.to_string(),
                })
        })
    }

    async fn get_service_ids(&self) -> Result<Vec<String>, BackendError> {
        self.with_enclave(|enclave| {
            Ok(enclave
                .services
                .iter()
                .map(|s| s.service_id.clone())
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_backend() -> StaticClusterBackend {
        StaticClusterBackend::new(Topology {
            enclaves: vec![EnclaveTopology::new("e1", "10.1.0.2:9501").with_service(
                ServiceTopology::new("svc-a", "10.0.0.5").with_port("http", PortSpec::tcp(8080)),
            )],
        })
    }

    #[tokio::test]
    async fn test_lookup_enclave_and_service() {
        let backend = sample_backend();
        let info = backend.get_enclave("e1").await.unwrap();
        assert_eq!(info.relay_endpoint.as_deref(), Some("10.1.0.2:9501"));

        let ctx = backend.get_enclave_context("e1").await.unwrap();
        let svc = ctx.get_service_context("svc-a").await.unwrap();
        assert_eq!(svc.private_ip_address(), "10.0.0.5");
        assert_eq!(svc.private_ports()["http"].number, 8080);
    }

    #[tokio::test]
    async fn test_missing_ids() {
        let backend = sample_backend();
        assert_eq!(
            backend.get_enclave("nope").await.unwrap_err(),
            BackendError::EnclaveNotFound("nope".into())
        );
        let ctx = backend.get_enclave_context("e1").await.unwrap();
        assert!(matches!(
            ctx.get_service_context("svc-z").await,
            Err(BackendError::ServiceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_context_sees_service_restart() {
        let backend = sample_backend();
        let ctx = backend.get_enclave_context("e1").await.unwrap();

        backend
            .upsert_service(
                "e1",
                ServiceTopology::new("svc-a", "10.0.0.9").with_port("http", PortSpec::tcp(8080)),
            )
            .unwrap();

        let svc = ctx.get_service_context("svc-a").await.unwrap();
        assert_eq!(svc.private_ip_address(), "10.0.0.9");
        assert_eq!(ctx.get_service_ids().await.unwrap(), vec!["svc-a".to_string()]);
    }

    #[tokio::test]
    async fn test_load_topology_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("topology.json");
        let json = r#"{
            "enclaves": [{
                "enclaveId": "e1",
                "relayEndpoint": "127.0.0.1:9501",
                "services": [{
                    "serviceId": "db",
                    "privateIpAddress": "10.0.0.7",
                    "ports": { "postgres": { "number": 5432 } }
                }]
            }]
        }"#;
        tokio::fs::write(&path, json).await.unwrap();

        let topology = Topology::from_json_file(&path).await.unwrap();
        let backend = StaticClusterBackend::new(topology);
        let ctx = backend.get_enclave_context("e1").await.unwrap();
        let svc = ctx.get_service_context("db").await.unwrap();
        assert_eq!(svc.private_ports()["postgres"], PortSpec::tcp(5432));
    }
}
