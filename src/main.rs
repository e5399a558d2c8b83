//! slservices - Straylight IRC Services
//!
//! Links to a TS6 ircd over the single-threaded slirc-sockio engine.

mod config;
mod telemetry;
mod uplink;

use crate::config::Config;
use crate::uplink::Uplink;
use slirc_sockio::SockIo;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "slservices.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    if let Err(errors) = config::validate(&config) {
        for e in &errors {
            error!(error = %e, "Invalid configuration");
        }
        anyhow::bail!("{} configuration error(s) in {}", errors.len(), config_path);
    }

    info!(
        name = %config.services.name,
        sid = %config.services.sid,
        uplink = %format_args!("{}:{}", config.uplink.host, config.uplink.port),
        "Starting slservices"
    );

    let mut io = SockIo::new(&config.sockets);
    let uplink = Uplink::new(&mut io, &config)?;
    uplink.start(&mut io);

    loop {
        io.check_sockets()?;
        uplink.tick(&mut io, Instant::now());
    }
}
