//! Port Forwarding Module
//!
//! Forwards private enclave service ports to local TCP ports through the
//! enclave's tunnel relay.

mod enumerator;
pub mod manager;
pub mod ports;
pub mod relay;
mod retry;
mod target;
#[cfg(test)]
mod test_support;
pub mod tracker;
pub mod tunnel;

pub use enumerator::ServiceEnumerator;
pub use manager::PortForwardManager;
pub use ports::allocate_ephemeral_port;
pub use relay::{
    DirectConnector, RelayConnector, RelayControl, RelayError, RelayTransport, RemoteSpec,
    TrafficMeter, WebSocketConnector,
};
pub use retry::RetryPolicy;
pub use target::{EnclaveServicePort, ServiceInterfaceDetail, TargetSpecifier};
pub use tracker::{ForwardOutcome, TunnelSessionTracker};
pub use tunnel::{PortForwardTunnel, TunnelConfig, TunnelInfo, TunnelStats, TunnelStatus};
