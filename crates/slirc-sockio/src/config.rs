//! Engine configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::budget::{BudgetConfig, MIN_BUFFER};

/// Buffer ceilings and reactor timing.
///
/// Deserialises from a `[sockets]` style TOML table; every field has a
/// default.
#[derive(Debug, Clone, Deserialize)]
pub struct SockConfig {
    /// Maximum read plus write buffer bytes per connection (0 = unlimited).
    #[serde(default)]
    pub per_connection_limit: usize,
    /// Maximum buffer bytes across all connections (0 = unlimited).
    #[serde(default)]
    pub total_limit: usize,
    /// Longest a single `check_sockets` pass waits for events, in
    /// milliseconds (0 = wait until something happens).
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Initial and minimum size of each connection buffer.
    #[serde(default = "default_min_buffer")]
    pub min_buffer: usize,
}

impl Default for SockConfig {
    fn default() -> Self {
        Self {
            per_connection_limit: 0,
            total_limit: 0,
            read_timeout_ms: default_read_timeout_ms(),
            min_buffer: default_min_buffer(),
        }
    }
}

impl SockConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    pub fn budget(&self) -> BudgetConfig {
        BudgetConfig {
            per_connection: self.per_connection_limit,
            total: self.total_limit,
            // A ring needs one spare byte to tell full from empty.
            min_buffer: self.min_buffer.max(2),
        }
    }
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_min_buffer() -> usize {
    MIN_BUFFER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SockConfig::default();
        assert_eq!(config.per_connection_limit, 0);
        assert_eq!(config.total_limit, 0);
        assert_eq!(config.read_timeout(), Some(Duration::from_secs(1)));
        assert_eq!(config.budget().min_buffer, 4096);
    }

    #[test]
    fn parses_partial_table() {
        let config: SockConfig = toml::from_str(
            r#"
            per_connection_limit = 65536
            read_timeout_ms = 0
            "#,
        )
        .expect("valid toml");
        assert_eq!(config.per_connection_limit, 65536);
        assert_eq!(config.total_limit, 0);
        assert_eq!(config.read_timeout(), None);
        assert_eq!(config.min_buffer, 4096);
    }

    #[test]
    fn tiny_min_buffer_is_clamped() {
        let config = SockConfig {
            min_buffer: 0,
            ..SockConfig::default()
        };
        assert_eq!(config.budget().min_buffer, 2);
    }
}
