//! Portal configuration types

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::forwarding::{
    DirectConnector, RelayConnector, RetryPolicy, TunnelConfig, WebSocketConnector,
};

/// Current config format version
pub const CONFIG_VERSION: u32 = 1;

/// Default port of the control API
pub const DEFAULT_CONTROL_PORT: u16 = 9720;

/// How tunnels reach enclave services
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// TCP over WebSocket through the enclave relay
    #[default]
    Websocket,
    /// Dial service addresses directly
    Direct,
}

/// Relay client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub mode: RelayMode,
    pub keepalive_secs: u64,
    pub initial_retry_interval_ms: u64,
    pub max_retry_interval_secs: u64,
    /// `None` retries forever
    pub max_retry_count: Option<u32>,
    pub connect_timeout_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            mode: RelayMode::Websocket,
            keepalive_secs: 25,
            initial_retry_interval_ms: 250,
            max_retry_interval_secs: 10,
            max_retry_count: None,
            connect_timeout_secs: 10,
        }
    }
}

impl RelaySettings {
    pub fn connector(&self) -> Arc<dyn RelayConnector> {
        let connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        match self.mode {
            RelayMode::Websocket => Arc::new(WebSocketConnector::new(
                connect_timeout,
                Duration::from_secs(self.keepalive_secs),
            )),
            RelayMode::Direct => Arc::new(DirectConnector::new(connect_timeout)),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        defaults
            .clone()
            .with_backoff(
                Duration::from_millis(self.initial_retry_interval_ms),
                defaults.multiplier,
                Duration::from_secs(self.max_retry_interval_secs),
            )
            .with_max_attempts(self.max_retry_count)
    }
}

/// Root configuration file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortalConfig {
    /// Config format version
    pub version: u32,
    /// Listen address of the control API
    pub control_address: SocketAddr,
    /// Local address forwarded ports are bound on
    pub forward_bind_address: IpAddr,
    pub relay: RelaySettings,
    /// JSON topology served by the static backend
    pub topology_file: Option<PathBuf>,
    /// `tracing` filter used when `RUST_LOG` is unset
    pub log_filter: Option<String>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            control_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_CONTROL_PORT),
            forward_bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            relay: RelaySettings::default(),
            topology_file: None,
            log_filter: None,
        }
    }
}

impl PortalConfig {
    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            bind_address: self.forward_bind_address,
            keepalive_interval: Duration::from_secs(self.relay.keepalive_secs),
            retry: self.relay.retry_policy(),
            ..TunnelConfig::default()
        }
    }
}
