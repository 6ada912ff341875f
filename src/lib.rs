//! kurtosis-portal - local port forwarding into Kurtosis enclaves
//!
//! Exposes private enclave service ports on local TCP ports by tunnelling
//! through the relay that runs next to each enclave, and serves a small
//! control API for creating and stopping those forwards.

// Use mimalloc as the global allocator for better performance
// with high-frequency small allocations (relay frames, JSON messages)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod backend;
pub mod config;
pub mod control;
pub mod error;
pub mod forwarding;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use backend::{StaticClusterBackend, Topology};
use config::PortalConfig;
use control::ControlServer;
use error::PortalError;
use forwarding::PortForwardManager;

pub use error::ErrorKind;

/// Initialize logging; `RUST_LOG` wins over `default_filter`, then "info"
pub fn init_logging(default_filter: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the manager for `config`, backed by its topology file
pub async fn build_manager(config: &PortalConfig) -> Result<Arc<PortForwardManager>, PortalError> {
    let topology = match &config.topology_file {
        Some(path) => {
            let topology = Topology::from_json_file(path).await.map_err(|e| {
                std::io::Error::new(
                    e.kind(),
                    format!("Failed to load topology from {:?}: {}", path, e),
                )
            })?;
            tracing::info!(
                "Loaded {} enclave(s) from {:?}",
                topology.enclaves.len(),
                path
            );
            topology
        }
        None => {
            tracing::warn!("No topology file configured, no enclaves will be resolvable");
            Topology::default()
        }
    };

    Ok(Arc::new(PortForwardManager::new(
        Arc::new(StaticClusterBackend::new(topology)),
        config.relay.connector(),
        config.tunnel_config(),
    )))
}

/// Run the portal daemon until `shutdown` fires, then stop every tunnel
pub async fn run(config: PortalConfig, shutdown: CancellationToken) -> Result<(), PortalError> {
    let manager = build_manager(&config).await?;
    let server = ControlServer::bind(config.control_address, manager.clone()).await?;

    tracing::info!(
        "Portal ready (relay mode: {:?}, forwards bound on {})",
        config.relay.mode,
        config.forward_bind_address
    );
    server.run(shutdown).await;

    manager.stop_all().await;
    Ok(())
}
