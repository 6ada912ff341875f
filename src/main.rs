use std::process::ExitCode;

use kurtosis_portal::config::ConfigStorage;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    let storage = match ConfigStorage::locate() {
        Ok(storage) => storage,
        Err(e) => {
            eprintln!("kurtosis-portal: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let config = match storage.load().await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("kurtosis-portal: failed to load {:?}: {}", storage.path(), e);
            return ExitCode::FAILURE;
        }
    };

    kurtosis_portal::init_logging(config.log_filter.as_deref());
    tracing::info!("Starting kurtosis-portal with config {:?}", storage.path());

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown requested");
                signal.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for ctrl-c: {}", e),
        }
    });

    match kurtosis_portal::run(config, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Portal failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
