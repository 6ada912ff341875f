//! Control API wire protocol
//!
//! JSON text frames over WebSocket. Every request carries a numeric `id`
//! that is echoed on its response.
//!
//! ```text
//! -> {"id":1,"method":"forwardUserServicePort","enclaveId":"e1","serviceId":"svc-a","portId":"http"}
//! <- {"id":1,"type":"forwarded","forwards":[{"enclaveId":"e1","serviceId":"svc-a","portId":"http","localPortNumber":54231}]}
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, PortalError};
use crate::forwarding::{EnclaveServicePort, TunnelInfo};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub call: Call,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum Call {
    Ping,
    ForwardUserServicePort(ForwardArgs),
    StopUserServicePortForward(StopArgs),
    ListPortForwards,
}

/// Empty service/port ids widen the request; port 0 asks for ephemeral ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardArgs {
    pub enclave_id: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub port_id: String,
    #[serde(default)]
    pub local_port_number: u16,
}

impl ForwardArgs {
    pub fn new(target: &EnclaveServicePort, local_port_number: u16) -> Self {
        Self {
            enclave_id: target.enclave_id().to_string(),
            service_id: target.service_id().to_string(),
            port_id: target.port_id().to_string(),
            local_port_number,
        }
    }

    pub fn target(&self) -> EnclaveServicePort {
        EnclaveServicePort::new(&self.enclave_id, &self.service_id, &self.port_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopArgs {
    pub enclave_id: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub port_id: String,
}

impl StopArgs {
    pub fn new(target: &EnclaveServicePort) -> Self {
        Self {
            enclave_id: target.enclave_id().to_string(),
            service_id: target.service_id().to_string(),
            port_id: target.port_id().to_string(),
        }
    }

    pub fn target(&self) -> EnclaveServicePort {
        EnclaveServicePort::new(&self.enclave_id, &self.service_id, &self.port_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(flatten)]
    pub reply: Reply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Reply {
    Pong,
    Forwarded(ForwardedPorts),
    Stopped,
    Forwards(TunnelList),
    Error(ErrorReply),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedPort {
    pub enclave_id: String,
    pub service_id: String,
    pub port_id: String,
    pub local_port_number: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedPorts {
    pub forwards: Vec<ForwardedPort>,
}

impl ForwardedPorts {
    /// Ordered by target so replies are stable
    pub fn from_map(ports: HashMap<EnclaveServicePort, u16>) -> Self {
        let mut ports: Vec<_> = ports.into_iter().collect();
        ports.sort();
        Self {
            forwards: ports
                .into_iter()
                .map(|(target, local_port_number)| ForwardedPort {
                    enclave_id: target.enclave_id().to_string(),
                    service_id: target.service_id().to_string(),
                    port_id: target.port_id().to_string(),
                    local_port_number,
                })
                .collect(),
        }
    }

    pub fn into_map(self) -> HashMap<EnclaveServicePort, u16> {
        self.forwards
            .into_iter()
            .map(|f| {
                (
                    EnclaveServicePort::new(f.enclave_id, f.service_id, f.port_id),
                    f.local_port_number,
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelList {
    pub tunnels: Vec<TunnelInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PortalError> for ErrorReply {
    fn from(err: &PortalError) -> Self {
        Self {
            kind: err.kind(),
            message: err.message(),
        }
    }
}

impl From<ErrorReply> for PortalError {
    fn from(reply: ErrorReply) -> Self {
        PortalError::from_kind(reply.kind, reply.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let request: Request = serde_json::from_value(json!({
            "id": 7,
            "method": "forwardUserServicePort",
            "enclaveId": "e1",
            "serviceId": "svc-a"
        }))
        .unwrap();
        assert_eq!(request.id, 7);
        let Call::ForwardUserServicePort(args) = request.call else {
            panic!("unexpected call: {:?}", request.call);
        };
        assert_eq!(args.target(), EnclaveServicePort::service("e1", "svc-a"));
        assert_eq!(args.local_port_number, 0);

        let ping: Request = serde_json::from_value(json!({"id": 1, "method": "ping"})).unwrap();
        assert_eq!(ping.call, Call::Ping);
    }

    #[test]
    fn test_error_reply_wire_format() {
        let err = PortalError::NotFound("service 'svc-z' not found".into());
        let response = Response {
            id: 3,
            reply: Reply::Error(ErrorReply::from(&err)),
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "id": 3,
                "type": "error",
                "kind": "notFound",
                "message": "service 'svc-z' not found"
            })
        );
    }

    #[test]
    fn test_forwarded_ports_are_sorted() {
        let ports = HashMap::from([
            (EnclaveServicePort::new("e1", "svc-b", "grpc"), 40001),
            (EnclaveServicePort::new("e1", "svc-a", "http"), 40002),
        ]);
        let reply = ForwardedPorts::from_map(ports.clone());
        assert_eq!(reply.forwards[0].service_id, "svc-a");
        assert_eq!(reply.into_map(), ports);
    }
}
