//! Telemetry utilities.

/// Standardized span constructors for services observability.
pub mod spans {
    use tracing::{Span, info_span};

    /// Create a span for the uplink connection.
    pub fn uplink(host: &str, port: u16) -> Span {
        info_span!("uplink", host = %host, port)
    }
}
