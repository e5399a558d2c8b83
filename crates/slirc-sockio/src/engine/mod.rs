//! The socket engine.
//!
//! [`SockIo`] owns every connection, the descriptor table, the readiness
//! sets and the buffer budget. It is single-threaded: callbacks receive
//! `&mut SockIo` and may call back into it freely, including disconnecting
//! or freeing the very connection they were invoked for.
//!
//! The engine is split across three files:
//! - this one: allocation, callbacks, buffered reads and writes, queries
//! - [`lifecycle`]: connect, listen, accept, disconnect and teardown
//! - [`reactor`]: `check_sockets`, flushing and the read pass

mod lifecycle;
mod reactor;

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::budget::{Budget, Ceiling};
use crate::chunk::TriggerToken;
use crate::config::SockConfig;
use crate::connection::{
    Callback, CallbackKind, ConnId, ConnState, Connection, DisconnectCause, SlotFn,
};
use crate::error::SockError;
use crate::table::ConnTable;

/// Log a stale or foreign handle and build the error for it.
pub(crate) fn invalid(id: ConnId) -> SockError {
    warn!(conn = %id, "invalid connection handle");
    SockError::InvalidHandle(id)
}

struct Slot {
    generation: u32,
    conn: Option<Connection>,
}

/// Which of a connection's two buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Read,
    Write,
}

/// Buffer usage of one connection against the configured ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    /// Read plus write buffer capacity of this connection.
    pub connection_bytes: usize,
    /// Buffer capacity across all connections.
    pub total_bytes: usize,
    /// Per-connection ceiling (0 = unlimited).
    pub connection_limit: usize,
    /// Process-wide ceiling (0 = unlimited).
    pub total_limit: usize,
}

/// Socket reactor and connection arena.
pub struct SockIo {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    table: ConnTable,
    budget: Budget,
    read_timeout: Option<Duration>,
}

impl fmt::Debug for SockIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SockIo")
            .field("connections", &self.connection_count())
            .field("buffer_bytes", &self.budget.total())
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

impl Default for SockIo {
    fn default() -> Self {
        Self::new(&SockConfig::default())
    }
}

impl SockIo {
    pub fn new(config: &SockConfig) -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            table: ConnTable::new(),
            budget: Budget::new(config.budget()),
            read_timeout: config.read_timeout(),
        }
    }

    // ------------------------------------------------------------------
    // Global configuration
    // ------------------------------------------------------------------

    /// Set the per-connection and process-wide buffer ceilings (0 = unlimited).
    pub fn set_buffer_limits(&mut self, per_connection: usize, total: usize) {
        self.budget.set_limits(per_connection, total);
    }

    /// Longest a `check_sockets` pass waits; `None` waits indefinitely.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Buffer bytes allocated across all connections.
    pub fn total_buffer_bytes(&self) -> usize {
        self.budget.total()
    }

    pub fn connection_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.conn.as_ref().is_some_and(|c| c.state != ConnState::Freed))
            .count()
    }

    // ------------------------------------------------------------------
    // Arena
    // ------------------------------------------------------------------

    /// Allocate an unbound connection with minimum-size buffers.
    pub fn create(&mut self) -> Result<ConnId, SockError> {
        let min = self.budget.config().min_buffer;
        self.budget.admit(2 * min, 0).map_err(SockError::Capacity)?;
        self.budget.charge(2 * min);
        let conn = Connection::new(min);

        let id = match self.vacant.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.conn = Some(conn);
                ConnId::new(index, slot.generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    conn: Some(conn),
                });
                ConnId::new(index, 0)
            }
        };
        debug!(conn = %id, "connection created");
        Ok(id)
    }

    /// Free a connection, disconnecting it first if it is still bound.
    ///
    /// Freeing from inside one of the connection's own callbacks is allowed;
    /// the handle becomes invalid at once and the memory is released when
    /// the outermost callback returns.
    pub fn free(&mut self, id: ConnId) -> Result<(), SockError> {
        let state = self.conn(id).ok_or_else(|| invalid(id))?.state;
        if matches!(
            state,
            ConnState::Connecting | ConnState::Connected | ConnState::Listener
        ) {
            self.teardown(id, DisconnectCause::Local, None);
        }
        // Teardown of an accepted connection may already have freed it.
        let Some(conn) = self.conn_mut(id) else {
            return Ok(());
        };
        if conn.callback_depth > 0 {
            conn.state = ConnState::Freed;
        } else {
            self.release(id);
        }
        Ok(())
    }

    /// Live connection (not freed).
    pub(crate) fn conn(&self, id: ConnId) -> Option<&Connection> {
        self.slots
            .get(id.index())
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.conn.as_ref())
            .filter(|c| c.state != ConnState::Freed)
    }

    pub(crate) fn conn_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.any_conn_mut(id).filter(|c| c.state != ConnState::Freed)
    }

    /// Connection in any state, including freed-but-not-released.
    fn any_conn_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slots
            .get_mut(id.index())
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.conn.as_mut())
    }

    /// Every live connection with its handle.
    fn live(&self) -> impl Iterator<Item = (ConnId, &Connection)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let conn = slot.conn.as_ref().filter(|c| c.state != ConnState::Freed)?;
            Some((ConnId::new(index as u32, slot.generation), conn))
        })
    }

    /// Drop the connection record and retire its handle.
    fn release(&mut self, id: ConnId) {
        let Some(slot) = self
            .slots
            .get_mut(id.index())
            .filter(|s| s.generation == id.generation())
        else {
            return;
        };
        let Some(conn) = slot.conn.take() else {
            return;
        };
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(fd) = conn.fd {
            self.table.unregister(fd);
        }
        self.budget.release(conn.buffer_bytes());
        self.vacant.push(id.index() as u32);
        debug!(conn = %id, "connection freed");
    }

    /// Recompute the readiness bits of `id` from its state.
    pub(crate) fn sync_interest(&mut self, id: ConnId) {
        let Some(conn) = self.conn(id) else {
            return;
        };
        let Some(fd) = conn.fd else {
            return;
        };
        let (read, write) = (conn.wants_read(), conn.wants_write());
        self.table.set_read(fd, read);
        self.table.set_write(fd, write);
    }

    // ------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------

    /// Install a handler in one of the connection's six slots.
    pub fn set_callback(&mut self, id: ConnId, callback: Callback) -> Result<(), SockError> {
        let conn = self.conn_mut(id).ok_or_else(|| invalid(id))?;
        conn.callbacks.set(callback);
        Ok(())
    }

    pub fn clear_callback(&mut self, id: ConnId, kind: CallbackKind) -> Result<(), SockError> {
        let conn = self.conn_mut(id).ok_or_else(|| invalid(id))?;
        conn.callbacks.clear(kind);
        Ok(())
    }

    /// Run one handler with the connection marked as mid-callback.
    ///
    /// The handler is taken out of its slot for the call, so a connection
    /// never has two invocations of the same handler active. Returns `None`
    /// if the connection is gone or the slot is empty.
    pub(crate) fn fire<T, R>(
        &mut self,
        id: ConnId,
        kind: CallbackKind,
        slot: SlotFn<T>,
        call: impl FnOnce(&mut Self, &mut T) -> R,
    ) -> Option<R> {
        let mut cb = {
            let conn = self.conn_mut(id)?;
            let cb = conn.callbacks.take(kind, slot)?;
            conn.callback_depth += 1;
            cb
        };
        let result = call(self, &mut cb);

        if let Some(conn) = self.any_conn_mut(id) {
            conn.callback_depth -= 1;
            conn.callbacks.restore(kind, slot, cb);
            if conn.callback_depth == 0 && conn.state == ConnState::Freed {
                self.release(id);
            }
        }
        Some(result)
    }

    // ------------------------------------------------------------------
    // Per-connection settings and queries
    // ------------------------------------------------------------------

    pub fn state(&self, id: ConnId) -> Option<ConnState> {
        self.conn(id).map(|c| c.state)
    }

    pub fn is_connected(&self, id: ConnId) -> bool {
        self.conn(id).is_some_and(|c| c.state == ConnState::Connected)
    }

    pub fn is_listener(&self, id: ConnId) -> bool {
        self.conn(id).is_some_and(|c| c.state == ConnState::Listener)
    }

    /// A local disconnect is waiting for the write buffer to drain, or
    /// teardown is in progress.
    pub fn is_disconnecting(&self, id: ConnId) -> bool {
        self.conn(id)
            .is_some_and(|c| c.disconnect_requested || c.state == ConnState::Disconnecting)
    }

    pub fn remote_addr(&self, id: ConnId) -> Option<SocketAddr> {
        self.conn(id).and_then(|c| c.remote)
    }

    pub fn local_addr(&self, id: ConnId) -> Option<SocketAddr> {
        self.conn(id)
            .and_then(|c| c.socket.as_ref())
            .and_then(|s| s.local_addr().ok())
            .and_then(|a| a.as_socket())
    }

    /// Stop delivering read and accept events. Bytes keep queueing in the
    /// kernel until unmuted.
    pub fn mute(&mut self, id: ConnId) -> Result<(), SockError> {
        let conn = self.conn_mut(id).ok_or_else(|| invalid(id))?;
        conn.muted = true;
        self.sync_interest(id);
        Ok(())
    }

    /// Resume read and accept events. The next pass treats the connection
    /// as readable even without a fresh OS event.
    pub fn unmute(&mut self, id: ConnId) -> Result<(), SockError> {
        let conn = self.conn_mut(id).ok_or_else(|| invalid(id))?;
        conn.muted = false;
        conn.force_read = matches!(conn.state, ConnState::Connected | ConnState::Listener);
        self.sync_interest(id);
        Ok(())
    }

    pub fn is_muted(&self, id: ConnId) -> bool {
        self.conn(id).is_some_and(|c| c.muted)
    }

    /// In blocking mode a write that finds its buffer at the ceiling waits
    /// for the socket to drain instead of returning short.
    pub fn set_blocking(&mut self, id: ConnId, blocking: bool) -> Result<(), SockError> {
        let conn = self.conn_mut(id).ok_or_else(|| invalid(id))?;
        conn.blocking = blocking;
        Ok(())
    }

    pub fn is_blocking(&self, id: ConnId) -> bool {
        self.conn(id).is_some_and(|c| c.blocking)
    }

    /// Disconnect if queued data makes no progress for `timeout`.
    pub fn set_write_timeout(&mut self, id: ConnId, timeout: Option<Duration>) -> Result<(), SockError> {
        let conn = self.conn_mut(id).ok_or_else(|| invalid(id))?;
        conn.write_timeout = timeout.filter(|t| !t.is_zero());
        Ok(())
    }

    pub fn write_timeout(&self, id: ConnId) -> Option<Duration> {
        self.conn(id).and_then(|c| c.write_timeout)
    }

    /// Bytes waiting in the read buffer.
    pub fn read_len(&self, id: ConnId) -> usize {
        self.conn(id).map_or(0, |c| c.rbuf.len())
    }

    /// Bytes queued and not yet sent, spans included.
    pub fn write_len(&self, id: ConnId) -> usize {
        self.conn(id).map_or(0, Connection::pending_write_bytes)
    }

    /// Total bytes `(read, written)` since the connection was bound.
    pub fn rw_stats(&self, id: ConnId) -> Result<(u64, u64), SockError> {
        self.conn(id)
            .map(|c| (c.bytes_read, c.bytes_written))
            .ok_or_else(|| invalid(id))
    }

    pub fn buffer_stats(&self, id: ConnId) -> Result<BufferStats, SockError> {
        let conn = self.conn(id).ok_or_else(|| invalid(id))?;
        let config = self.budget.config();
        Ok(BufferStats {
            connection_bytes: conn.buffer_bytes(),
            total_bytes: self.budget.total(),
            connection_limit: config.per_connection,
            total_limit: config.total,
        })
    }

    // ------------------------------------------------------------------
    // Buffered reads
    // ------------------------------------------------------------------

    fn readable_conn(&mut self, id: ConnId) -> Result<&mut Connection, SockError> {
        self.conn_mut(id).ok_or_else(|| invalid(id))
    }

    /// Bookkeeping after the consumer took bytes out of the read buffer.
    fn after_read(&mut self, id: ConnId) {
        if let Some(conn) = self.conn_mut(id)
            && conn.read_stalled
        {
            conn.read_stalled = false;
            self.sync_interest(id);
        }
    }

    pub fn read_byte(&mut self, id: ConnId) -> Result<Option<u8>, SockError> {
        let byte = self.readable_conn(id)?.rbuf.read_byte();
        self.after_read(id);
        Ok(byte)
    }

    /// Remove and return one complete line, terminator included, or `None`
    /// if no full line is buffered yet.
    pub fn read_line(&mut self, id: ConnId) -> Result<Option<Vec<u8>>, SockError> {
        let line = self.readable_conn(id)?.rbuf.pop_line();
        self.after_read(id);
        Ok(line)
    }

    /// Like [`read_line`](Self::read_line) with trailing CR/LF removed.
    pub fn read_line_trimmed(&mut self, id: ConnId) -> Result<Option<Vec<u8>>, SockError> {
        Ok(self.read_line(id)?.map(|mut line| {
            while matches!(line.last(), Some(b'\n' | b'\r')) {
                line.pop();
            }
            line
        }))
    }

    /// Copy up to `out.len()` buffered bytes out.
    pub fn read_bytes(&mut self, id: ConnId, out: &mut [u8]) -> Result<usize, SockError> {
        let n = self.readable_conn(id)?.rbuf.pop_into(out);
        self.after_read(id);
        Ok(n)
    }

    // ------------------------------------------------------------------
    // Buffered writes
    // ------------------------------------------------------------------

    fn writable_conn(&mut self, id: ConnId) -> Result<&mut Connection, SockError> {
        let conn = self.conn_mut(id).ok_or_else(|| invalid(id))?;
        match conn.state {
            ConnState::Connecting | ConnState::Connected if !conn.disconnect_requested => {
                if !conn.has_pending_writes() {
                    conn.last_write = Instant::now();
                }
                Ok(conn)
            }
            _ => Err(SockError::NotConnected(id)),
        }
    }

    /// Queue bytes for sending. Returns how many were accepted.
    ///
    /// A short count means a buffer ceiling was reached; the rest is not
    /// queued and the connection stays up. Blocking connections wait for
    /// the socket to drain instead.
    pub fn write_bytes(&mut self, id: ConnId, data: &[u8]) -> Result<usize, SockError> {
        let mut written = self.writable_conn(id)?.wbuf.push(data);
        while written < data.len() {
            match self.grow_buffer(id, Side::Write) {
                Ok(()) => {}
                Err(ceiling) => {
                    let blocking = self
                        .conn(id)
                        .is_some_and(|c| c.blocking && c.state == ConnState::Connected);
                    if !blocking || !self.wait_writable(id) {
                        self.warn_over_limit(id, ceiling);
                        break;
                    }
                }
            }
            let Some(conn) = self.conn_mut(id) else {
                break;
            };
            written += conn.wbuf.push(&data[written..]);
        }
        self.sync_interest(id);
        Ok(written)
    }

    pub fn write_str(&mut self, id: ConnId, s: &str) -> Result<usize, SockError> {
        self.write_bytes(id, s.as_bytes())
    }

    /// `write!`-style output: `io.write_formatted(id, format_args!(..))`.
    pub fn write_formatted(&mut self, id: ConnId, args: fmt::Arguments<'_>) -> Result<usize, SockError> {
        match args.as_str() {
            Some(s) => self.write_bytes(id, s.as_bytes()),
            None => self.write_bytes(id, args.to_string().as_bytes()),
        }
    }

    /// Queue a span without copying it into the write buffer. It is sent
    /// after everything queued before it and before anything queued after.
    pub fn write_span(&mut self, id: ConnId, data: Bytes) -> Result<usize, SockError> {
        let len = data.len();
        let conn = self.writable_conn(id)?;
        let wait = conn.wbuf.len();
        conn.chunks.push_span(data, wait);
        self.sync_interest(id);
        Ok(len)
    }

    /// Queue a trigger: the trigger callback fires with `token` once every
    /// byte queued before this call has been sent.
    pub fn write_trigger(&mut self, id: ConnId, token: TriggerToken) -> Result<(), SockError> {
        let conn = self.writable_conn(id)?;
        let wait = conn.wbuf.len();
        conn.chunks.push_trigger(token, wait);
        self.sync_interest(id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Budget
    // ------------------------------------------------------------------

    /// Grow one buffer by a budget step.
    fn grow_buffer(&mut self, id: ConnId, side: Side) -> Result<(), Ceiling> {
        let Some(conn) = self.conn(id) else {
            return Err(Ceiling::PerConnection);
        };
        let current = match side {
            Side::Read => conn.rbuf.capacity(),
            Side::Write => conn.wbuf.capacity(),
        };
        let target = self.budget.grow_target(current, conn.buffer_bytes())?;

        let Some(conn) = self.conn_mut(id) else {
            return Err(Ceiling::PerConnection);
        };
        let buf = match side {
            Side::Read => &mut conn.rbuf,
            Side::Write => &mut conn.wbuf,
        };
        if !buf.resize(target) {
            warn!(conn = %id, bytes = target, "buffer allocation failed");
            return Err(Ceiling::Allocation);
        }
        self.budget.charge(target - current);
        Ok(())
    }

    /// Shrink drained buffers back to the minimum size.
    fn reclaim(&mut self, id: ConnId) {
        let budget = &mut self.budget;
        let Some(slot) = self
            .slots
            .get_mut(id.index())
            .filter(|s| s.generation == id.generation())
        else {
            return;
        };
        let Some(conn) = slot.conn.as_mut() else {
            return;
        };
        for buf in [&mut conn.rbuf, &mut conn.wbuf] {
            let current = buf.capacity();
            if let Some(target) = budget.shrink_target(current, buf.len())
                && buf.resize(target)
            {
                budget.release(current - target);
            }
        }
    }

    /// Restore minimum-size buffers on a connection that has none (a former
    /// listener).
    fn ensure_buffers(&mut self, id: ConnId) -> Result<(), SockError> {
        let min = self.budget.config().min_buffer;
        let conn = self.conn(id).ok_or_else(|| invalid(id))?;
        let missing = min.saturating_sub(conn.rbuf.capacity()) + min.saturating_sub(conn.wbuf.capacity());
        if missing == 0 {
            return Ok(());
        }
        self.budget
            .admit(missing, conn.buffer_bytes())
            .map_err(SockError::Capacity)?;
        let conn = self.conn_mut(id).ok_or_else(|| invalid(id))?;
        let mut added = 0;
        for buf in [&mut conn.rbuf, &mut conn.wbuf] {
            let current = buf.capacity();
            if current < min && buf.resize(min) {
                added += min - current;
            }
        }
        self.budget.charge(added);
        Ok(())
    }

    /// Give up both buffers (listeners carry none).
    fn drop_buffers(&mut self, id: ConnId) {
        let Some(conn) = self.conn_mut(id) else {
            return;
        };
        let freed = conn.buffer_bytes();
        conn.rbuf = Default::default();
        conn.wbuf = Default::default();
        self.budget.release(freed);
    }

    fn warn_over_limit(&mut self, id: ConnId, ceiling: Ceiling) {
        if let Some(conn) = self.conn_mut(id)
            && !conn.warned
        {
            conn.warned = true;
            let bytes = conn.buffer_bytes();
            warn!(conn = %id, %ceiling, bytes, "connection buffer cannot grow");
        }
    }
}
