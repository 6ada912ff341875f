//! Forwarding targets
//!
//! `EnclaveServicePort` is what callers hand to the manager; an empty service
//! or port id widens the request. Validation turns it into an explicit
//! `TargetSpecifier` so scope expansion never depends on empty-string checks.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::PortSpec;
use crate::error::PortalError;

/// Identifies a forwarding target (or a scope of targets)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnclaveServicePort {
    enclave_id: String,
    #[serde(default)]
    service_id: String,
    #[serde(default)]
    port_id: String,
}

impl EnclaveServicePort {
    pub fn new(
        enclave_id: impl Into<String>,
        service_id: impl Into<String>,
        port_id: impl Into<String>,
    ) -> Self {
        Self {
            enclave_id: enclave_id.into(),
            service_id: service_id.into(),
            port_id: port_id.into(),
        }
    }

    /// Every service and port of an enclave
    pub fn enclave(enclave_id: impl Into<String>) -> Self {
        Self::new(enclave_id, "", "")
    }

    /// Every port of one service
    pub fn service(enclave_id: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self::new(enclave_id, service_id, "")
    }

    pub fn enclave_id(&self) -> &str {
        &self.enclave_id
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn port_id(&self) -> &str {
        &self.port_id
    }

    pub fn is_fully_qualified(&self) -> bool {
        !self.enclave_id.is_empty() && !self.service_id.is_empty() && !self.port_id.is_empty()
    }

    /// Validate and classify this reference
    pub fn specifier(&self) -> Result<TargetSpecifier, PortalError> {
        if self.enclave_id.is_empty() {
            return Err(PortalError::InvalidArgument(format!(
                "an enclave id is required to forward ports (got '{}')",
                self
            )));
        }
        match (self.service_id.is_empty(), self.port_id.is_empty()) {
            (true, false) => Err(PortalError::InvalidArgument(format!(
                "port id '{}' was given without a service id in enclave '{}'",
                self.port_id, self.enclave_id
            ))),
            (true, true) => Ok(TargetSpecifier::AllServicesOfEnclave {
                enclave_id: self.enclave_id.clone(),
            }),
            (false, true) => Ok(TargetSpecifier::AllPortsOfService {
                enclave_id: self.enclave_id.clone(),
                service_id: self.service_id.clone(),
            }),
            (false, false) => Ok(TargetSpecifier::Single(self.clone())),
        }
    }

    /// Whether `self` falls inside `scope`; empty scope fields match anything
    pub fn matches(&self, scope: &EnclaveServicePort) -> bool {
        self.enclave_id == scope.enclave_id
            && (scope.service_id.is_empty() || self.service_id == scope.service_id)
            && (scope.port_id.is_empty() || self.port_id == scope.port_id)
    }
}

impl fmt::Display for EnclaveServicePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.enclave_id)?;
        if !self.service_id.is_empty() {
            write!(f, "/{}", self.service_id)?;
        }
        if !self.port_id.is_empty() {
            write!(f, "/{}", self.port_id)?;
        }
        Ok(())
    }
}

/// Validated scope of a forwarding request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpecifier {
    /// Exactly one port of one service
    Single(EnclaveServicePort),
    AllPortsOfService {
        enclave_id: String,
        service_id: String,
    },
    AllServicesOfEnclave {
        enclave_id: String,
    },
}

impl TargetSpecifier {
    pub fn enclave_id(&self) -> &str {
        match self {
            TargetSpecifier::Single(target) => target.enclave_id(),
            TargetSpecifier::AllPortsOfService { enclave_id, .. } => enclave_id,
            TargetSpecifier::AllServicesOfEnclave { enclave_id } => enclave_id,
        }
    }

    pub fn is_single(&self) -> bool {
        matches!(self, TargetSpecifier::Single(_))
    }
}

impl fmt::Display for TargetSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSpecifier::Single(target) => write!(f, "port {}", target),
            TargetSpecifier::AllPortsOfService {
                enclave_id,
                service_id,
            } => write!(f, "every port of service {}/{}", enclave_id, service_id),
            TargetSpecifier::AllServicesOfEnclave { enclave_id } => {
                write!(f, "every service of enclave {}", enclave_id)
            }
        }
    }
}

/// Resolved, dialable location of one forwarding target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInterfaceDetail {
    /// Always fully qualified
    pub target: EnclaveServicePort,
    /// Relay endpoint of the enclave
    pub chisel_server_uri: String,
    pub service_ip: String,
    pub port: PortSpec,
}

impl ServiceInterfaceDetail {
    pub fn new(
        target: EnclaveServicePort,
        chisel_server_uri: impl Into<String>,
        service_ip: impl Into<String>,
        port: PortSpec,
    ) -> Self {
        Self {
            target,
            chisel_server_uri: chisel_server_uri.into(),
            service_ip: service_ip.into(),
            port,
        }
    }

    /// Same relay and remote address, ignoring the target key
    pub fn same_remote(&self, other: &ServiceInterfaceDetail) -> bool {
        self.chisel_server_uri == other.chisel_server_uri
            && self.service_ip == other.service_ip
            && self.port.number == other.port.number
    }
}
