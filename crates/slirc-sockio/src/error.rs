//! Engine error types.

use std::io;
use std::net::SocketAddr;

use nix::errno::Errno;
use thiserror::Error;

use crate::budget::Ceiling;
use crate::connection::ConnId;

/// Errors returned by [`SockIo`](crate::SockIo) calls.
///
/// Failures of an established connection are never reported here; they
/// arrive through the disconnect callback instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SockError {
    #[error("invalid connection handle {0}")]
    InvalidHandle(ConnId),

    #[error("connection {0} is not connected")]
    NotConnected(ConnId),

    #[error("connection {0} is already in use")]
    InUse(ConnId),

    #[error("connection {0} is not a listener")]
    NotListener(ConnId),

    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no usable address for {0}")]
    NoAddress(String),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("poll failed: {0}")]
    Poll(#[from] Errno),

    #[error("buffer limit reached: {0}")]
    Capacity(Ceiling),
}

impl SockError {
    /// Static label for logging and metrics.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidHandle(_) => "invalid_handle",
            Self::NotConnected(_) => "not_connected",
            Self::InUse(_) => "in_use",
            Self::NotListener(_) => "not_listener",
            Self::Resolve { .. } => "resolve_failed",
            Self::NoAddress(_) => "no_address",
            Self::Connect { .. } => "connect_failed",
            Self::Io(_) => "io_error",
            Self::Poll(_) => "poll_failed",
            Self::Capacity(_) => "capacity",
        }
    }
}

/// Would-block and interrupted calls are retried later, not reported.
#[inline]
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[inline]
pub(crate) fn is_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(Errno::EINPROGRESS as i32)
        || err.kind() == io::ErrorKind::WouldBlock
}
