//! Core configuration types and loading.

use serde::Deserialize;
use slirc_sockio::SockConfig;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Services daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Identity presented to the network.
    pub services: ServicesConfig,
    /// The ircd we link to.
    pub uplink: UplinkConfig,
    /// Socket engine buffer limits and timing.
    #[serde(default)]
    pub sockets: SockConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Services server identity.
#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    /// Server name (e.g., "services.straylight.net").
    pub name: String,
    /// Server ID for TS6 (3 characters).
    pub sid: String,
    /// Server description shown in LINKS.
    #[serde(default = "default_description")]
    pub description: String,
}

/// Uplink (hub ircd) connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct UplinkConfig {
    /// Hostname or IP of the ircd.
    pub host: String,
    /// Server port on the ircd.
    pub port: u16,
    /// Link password (must match the ircd's connect block).
    pub password: String,
    /// Local address to bind before connecting.
    #[serde(default)]
    pub bind: Option<SocketAddr>,
    /// Seconds to wait before relinking after a disconnect (default: 30).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
    /// Seconds queued output may stall before the link is dropped
    /// (default: 0, never).
    #[serde(default)]
    pub write_timeout: u64,
}

impl UplinkConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout > 0).then(|| Duration::from_secs(self.write_timeout))
    }
}

fn default_description() -> String {
    "IRC Services".to_string()
}

fn default_reconnect_delay() -> u64 {
    30
}
