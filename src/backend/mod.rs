//! Cluster Backend Module
//!
//! Collaborator interfaces for the orchestration backend (Docker, Kubernetes)
//! that hosts enclaves. The portal only reads from the backend: it needs the
//! relay endpoint of an enclave and the private network location of its
//! services.
//!
//! `StaticClusterBackend` serves a fixed topology and is used by the daemon
//! when no live backend is wired in, and by tests.

mod error;
mod static_backend;
mod types;

use std::sync::Arc;

use async_trait::async_trait;

pub use error::BackendError;
pub use static_backend::{EnclaveTopology, ServiceTopology, StaticClusterBackend, Topology};
pub use types::{EnclaveInfo, PortSpec, ServiceContext, TransportProtocol};

/// Read-only view of the cluster backend
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Look up an enclave, including its relay endpoint
    async fn get_enclave(&self, enclave_id: &str) -> Result<EnclaveInfo, BackendError>;

    /// Open a context for querying services inside an enclave
    async fn get_enclave_context(
        &self,
        enclave_id: &str,
    ) -> Result<Arc<dyn EnclaveContext>, BackendError>;

    /// List all enclaves (also used as a liveness probe)
    async fn get_enclaves(&self) -> Result<Vec<EnclaveInfo>, BackendError>;
}

/// Service queries scoped to a single enclave
#[async_trait]
pub trait EnclaveContext: Send + Sync {
    fn enclave_id(&self) -> &str;

    async fn get_service_context(&self, service_id: &str) -> Result<ServiceContext, BackendError>;

    async fn get_service_ids(&self) -> Result<Vec<String>, BackendError>;
}
