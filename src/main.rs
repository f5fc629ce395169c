//! relay-a-cache: a memcached-aware TCP proxy
//!
//! The proxy multiplexes many client connections over a small pool of
//! persistent upstream connections and provides:
//! - Request/response relaying for the memcached text protocol
//! - Active/backup failover driven by periodic health checks
//! - Slow-query latency logging
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod protocol;
mod proxy;
mod stats;

use config::Config;
use proxy::Proxy;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        name = %config.name,
        port = config.port,
        target = %config.target_server,
        backup = %config.backup_server,
        workers = config.worker_max,
        event_model = config.event_model.name(),
        "Starting relay-a-cache proxy"
    );

    // Create and run the proxy
    let proxy = Proxy::new(config)?;
    proxy.run()?;

    Ok(())
}
