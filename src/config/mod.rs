//! Configuration loading and management.
//!
//! This module is split into logical submodules:
//! - [`types`]: Core config struct definitions (Config, ServicesConfig, UplinkConfig)
//! - [`validation`]: Semantic checks run once at startup
//!
//! The `[sockets]` table deserialises straight into the engine's own
//! [`SockConfig`](slirc_sockio::SockConfig).

mod types;
mod validation;

pub use types::{Config, ConfigError, ServicesConfig, UplinkConfig};
pub use validation::{ValidationError, validate};
