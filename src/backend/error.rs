//! Backend error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("enclave '{0}' does not exist")]
    EnclaveNotFound(String),

    #[error("service '{service_id}' does not exist in enclave '{enclave_id}'")]
    ServiceNotFound {
        enclave_id: String,
        service_id: String,
    },

    #[error("port '{port_id}' does not exist on service '{service_id}' in enclave '{enclave_id}'")]
    PortNotFound {
        enclave_id: String,
        service_id: String,
        port_id: String,
    },

    #[error("cluster backend unreachable: {0}")]
    Unavailable(String),
}
