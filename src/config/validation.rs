//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.

use super::Config;
use thiserror::Error;

/// Validation errors for configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("services.name is required")]
    MissingServerName,
    #[error("services.sid must be exactly 3 characters, got {0}")]
    InvalidSid(usize),
    #[error("services.sid must match pattern [0-9][A-Z0-9][A-Z0-9], got '{0}'")]
    InvalidSidFormat(String),
    #[error("uplink.host is required")]
    MissingUplinkHost,
    #[error("uplink.port must be non-zero")]
    InvalidUplinkPort,
    #[error("uplink.password is required")]
    MissingUplinkPassword,
    #[error("sockets.read_timeout_ms must be non-zero")]
    ZeroReadTimeout,
    #[error("sockets.per_connection_limit ({limit}) must hold two {min_buffer}-byte buffers")]
    ConnectionLimitTooSmall { limit: usize, min_buffer: usize },
    #[error("sockets.total_limit ({total}) is below sockets.per_connection_limit ({per_connection})")]
    TotalLimitTooSmall { total: usize, per_connection: usize },
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.services.name.is_empty() {
        errors.push(ValidationError::MissingServerName);
    }

    // SID validation (TS6 format)
    let sid = &config.services.sid;
    if sid.len() != 3 {
        errors.push(ValidationError::InvalidSid(sid.len()));
    } else {
        let b = sid.as_bytes();
        let valid = b[0].is_ascii_digit()
            && (b[1].is_ascii_uppercase() || b[1].is_ascii_digit())
            && (b[2].is_ascii_uppercase() || b[2].is_ascii_digit());
        if !valid {
            errors.push(ValidationError::InvalidSidFormat(sid.clone()));
        }
    }

    let uplink = &config.uplink;
    if uplink.host.is_empty() {
        errors.push(ValidationError::MissingUplinkHost);
    }
    if uplink.port == 0 {
        errors.push(ValidationError::InvalidUplinkPort);
    }
    if uplink.password.is_empty() {
        errors.push(ValidationError::MissingUplinkPassword);
    }

    // The main loop relies on check_sockets returning to retry the link.
    let sockets = &config.sockets;
    if sockets.read_timeout_ms == 0 {
        errors.push(ValidationError::ZeroReadTimeout);
    }
    let min_buffer = sockets.budget().min_buffer;
    let per_connection = sockets.per_connection_limit;
    if per_connection != 0 && per_connection < 2 * min_buffer {
        errors.push(ValidationError::ConnectionLimitTooSmall {
            limit: per_connection,
            min_buffer,
        });
    }
    if sockets.total_limit != 0 && per_connection != 0 && sockets.total_limit < per_connection {
        errors.push(ValidationError::TotalLimitTooSmall {
            total: sockets.total_limit,
            per_connection,
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
