use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use livefire_common::{Database, LivefireConfig, VsphereConnector};
use livefire_web::server::{self, WebServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::var_os("LIVEFIRE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(livefire_common::default_config_path);

    let mut config = LivefireConfig::load(&config_path)?;
    config.apply_env_overrides();

    let web_addr: SocketAddr = config.server.listen.parse()?;

    // The service still serves target management without a hypervisor.
    let connection = match config.connection_params() {
        Ok(params) => Some(params),
        Err(e) => {
            warn!("Hypervisor connection unavailable: {}", e);
            None
        }
    };

    let db = Database::open(config.db_path())?;

    let cfg = WebServerConfig {
        admin_token: config.server.admin_token.clone(),
        connection,
        baseline_snapshot: config.revert.snapshot_name.clone(),
        revert: config.revert_options(),
    };

    info!(
        "Starting Livefire admin service on http://{} (config: {})",
        web_addr,
        config_path.display()
    );

    server::serve(web_addr, cfg, db, Arc::new(VsphereConnector::new())).await
}
