// ============================================================================
// LEDGERLITE NODE
// ============================================================================
//
// Boots one ledger node from a JSON config file:
//
//   ledgerlite [config.json]
//
// Fatal errors (bad config, unusable storage path, bind failure) exit the
// process; everything after startup is logged and survived.

use std::path::Path;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ledgerlite::{node, NodeConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let config = match NodeConfig::load(Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path, "FATAL: {}", e);
            std::process::exit(1);
        }
    };

    info!("╔══════════════════════════════════════════╗");
    info!("║  ledgerlite / replicated JSON ledger     ║");
    info!("╚══════════════════════════════════════════╝");
    info!(
        id = %config.id,
        listen = %config.self_url(),
        algorithm = ?config.consensus_algorithm,
        peers = config.nodes.len(),
        storage = %config.storage_path.display(),
        "configuration loaded"
    );

    let runtime = match node::start(config).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("FATAL: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal handler failed");
    }
    info!("shutting down");
    runtime.server.shutdown();
    runtime.handle.terminate();
    let _ = runtime.join.await;
}
