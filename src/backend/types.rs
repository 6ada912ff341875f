//! Backend data types

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport protocol of a service port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportProtocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Tcp => write!(f, "TCP"),
            TransportProtocol::Udp => write!(f, "UDP"),
            TransportProtocol::Sctp => write!(f, "SCTP"),
        }
    }
}

/// A port exposed by a service inside the backend network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    pub number: u16,
    #[serde(default)]
    pub protocol: TransportProtocol,
    /// Application protocol hint (e.g. "http")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_protocol: Option<String>,
}

impl PortSpec {
    pub fn tcp(number: u16) -> Self {
        Self {
            number,
            protocol: TransportProtocol::Tcp,
            application_protocol: None,
        }
    }

    pub fn new(number: u16, protocol: TransportProtocol) -> Self {
        Self {
            number,
            protocol,
            application_protocol: None,
        }
    }
}

/// Enclave summary returned by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnclaveInfo {
    pub enclave_id: String,
    pub name: String,
    /// Externally reachable `host:port` of the enclave's tunnel relay
    pub relay_endpoint: Option<String>,
}

/// Network location of a single service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceContext {
    pub service_id: String,
    pub private_ip_address: String,
    /// Ports keyed by port id
    pub private_ports: BTreeMap<String, PortSpec>,
}

impl ServiceContext {
    pub fn private_ip_address(&self) -> &str {
        &self.private_ip_address
    }

    pub fn private_ports(&self) -> &BTreeMap<String, PortSpec> {
        &self.private_ports
    }
}
