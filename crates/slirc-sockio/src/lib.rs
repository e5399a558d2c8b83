//! # slirc-sockio
//!
//! A single-threaded, callback-driven TCP socket engine for IRC services.
//!
//! One [`SockIo`] owns every connection. The host program calls
//! [`SockIo::check_sockets`] in a loop; each pass waits for readiness,
//! completes pending connects, accepts on listeners, reads into growable
//! ring buffers and flushes queued output, invoking the handlers installed
//! on each connection as things happen.
//!
//! Connections are named by [`ConnId`] handles. A handle carries a
//! generation, so using one after its connection was freed fails with
//! [`SockError::InvalidHandle`] instead of touching whoever took the slot.
//!
//! ```no_run
//! use slirc_sockio::{Callback, SockIo};
//!
//! let mut io = SockIo::default();
//! let conn = io.create()?;
//! io.set_callback(conn, Callback::on_line(|io, id, line| {
//!     if line.starts_with(b"PING") {
//!         let _ = io.write_str(id, "PONG\r\n");
//!     }
//! }))?;
//! io.connect(conn, "irc.example.net", 6667, None)?;
//! loop {
//!     io.check_sockets()?;
//! }
//! # Ok::<(), slirc_sockio::SockError>(())
//! ```
//!
//! ## Memory
//!
//! Every connection starts with two buffers of [`MIN_BUFFER`] bytes. They
//! grow on demand in steps, bounded by a per-connection ceiling and a
//! process-wide ceiling (see [`Budget`]), and shrink back once drained.
//! A write that would cross a ceiling is cut short rather than failing the
//! connection.

pub mod budget;
pub mod chunk;
pub mod config;
pub mod connection;
mod engine;
pub mod error;
pub mod ring;
pub mod table;

pub use budget::{Budget, BudgetConfig, Ceiling, MIN_BUFFER};
pub use chunk::{Chunk, TriggerToken, WriteQueue};
pub use config::SockConfig;
pub use connection::{Callback, CallbackKind, ConnId, ConnState, Disconnect, DisconnectCause};
pub use engine::{BufferStats, SockIo};
pub use error::SockError;
pub use ring::RingBuffer;
pub use table::{ConnTable, FdSet};
