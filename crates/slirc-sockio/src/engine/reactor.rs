//! The readiness loop.
//!
//! Each [`SockIo::check_sockets`] call is one pass:
//!
//! 1. collect the read and write readiness sets (plus connections unmuted
//!    since the last pass, which are treated as readable regardless)
//! 2. wait in `poll(2)` for at most the read timeout, cut short by the
//!    nearest write-timeout deadline, retrying on `EINTR`
//! 3. per ready descriptor: finish a pending connect or flush queued
//!    output; then accept on a listener, or read into the ring buffer and
//!    run the read and line callbacks until they stop consuming
//! 4. disconnect connections whose queued output made no progress within
//!    their write timeout
//!
//! Every callback may free or disconnect the connection it was called for,
//! so the connection is looked up again after each one.

use std::io::{self, Read};
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use socket2::Socket;
use tracing::{debug, error, warn};

use super::{Side, SockIo};
use crate::chunk::{Chunk, TriggerToken};
use crate::connection::{CallbackKind, Callbacks, ConnId, ConnState, Connection, DisconnectCause};
use crate::error::{SockError, is_transient};

/// Upper bound on `recv` calls per connection per pass.
const MAX_READS_PER_PASS: usize = 4;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly")))]
const SEND_FLAGS: libc::c_int = 0;

#[derive(Debug, Clone, Copy)]
struct Event {
    id: ConnId,
    readable: bool,
    writable: bool,
}

/// Result of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Flush {
    /// Nothing left to send.
    Drained,
    /// The socket stopped accepting data.
    Blocked,
    /// A trigger is due but the trigger handler is still running further up
    /// the stack; the outer flush fires it once that call returns.
    Held,
    /// The connection was torn down or is no longer connected.
    Gone,
}

/// One unit of flush work on a single connection.
enum Step {
    Sent { n: usize, wanted: usize },
    WouldBlock,
    Trigger(TriggerToken),
    Held,
    Idle,
    Failed(io::Error),
}

fn send(socket: &Socket, data: &[u8]) -> io::Result<usize> {
    loop {
        match socket.send_with_flags(data, SEND_FLAGS) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

/// Send whatever may go next: write-buffer bytes up to the front chunk,
/// then the front chunk itself.
fn flush_step(conn: &mut Connection) -> Step {
    let Connection {
        socket,
        wbuf,
        chunks,
        callbacks,
        ..
    } = conn;
    let Some(socket) = socket.as_ref() else {
        return Step::Idle;
    };

    let limit = chunks
        .front_wait()
        .map_or(wbuf.len(), |wait| wait.min(wbuf.len()));
    if limit > 0 {
        let (first, _) = wbuf.as_slices();
        let wanted = first.len().min(limit);
        return match send(socket, &first[..wanted]) {
            Ok(n) => {
                wbuf.consume(n);
                chunks.consumed(n);
                Step::Sent { n, wanted }
            }
            Err(e) if is_transient(&e) => Step::WouldBlock,
            Err(e) => Step::Failed(e),
        };
    }

    let Some(front) = chunks.front_mut() else {
        return Step::Idle;
    };
    match &mut front.chunk {
        Chunk::Span(span) => {
            let wanted = span.remaining().len();
            match send(socket, span.remaining()) {
                Ok(n) => {
                    span.advance(n);
                    if span.is_done() {
                        chunks.pop_front();
                    }
                    Step::Sent { n, wanted }
                }
                Err(e) if is_transient(&e) => Step::WouldBlock,
                Err(e) => Step::Failed(e),
            }
        }
        Chunk::Trigger(_) if callbacks.is_running(CallbackKind::Trigger) => Step::Held,
        Chunk::Trigger(token) => {
            let token = *token;
            chunks.pop_front();
            Step::Trigger(token)
        }
    }
}

fn to_poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(d) => {
            // Round up so a sub-millisecond deadline does not spin.
            let ms = d.as_micros().div_ceil(1000);
            PollTimeout::from(u16::try_from(ms).unwrap_or(u16::MAX))
        }
    }
}

impl SockIo {
    /// Run one reactor pass. Returns the number of descriptors that had
    /// events.
    ///
    /// Errors only if the OS wait itself fails; connection failures are
    /// delivered through disconnect callbacks.
    pub fn check_sockets(&mut self) -> Result<usize, SockError> {
        let timeout = self.next_timeout(Instant::now());
        let events = self.wait(timeout)?;
        let count = events.len();
        for event in events {
            self.dispatch(event);
        }
        self.expire_write_timeouts(Instant::now());
        Ok(count)
    }

    /// The read timeout, shortened to the nearest write-timeout deadline.
    fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.live()
            .filter(|(_, c)| awaiting_output(c))
            .filter_map(|(_, c)| c.write_timeout.map(|t| (c.last_write + t).saturating_duration_since(now)))
            .fold(self.read_timeout, |acc, left| {
                Some(acc.map_or(left, |cur| cur.min(left)))
            })
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Event>, SockError> {
        let forced: Vec<ConnId> = self
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| {
                let conn = slot.conn.as_mut()?;
                if !conn.force_read {
                    return None;
                }
                conn.force_read = false;
                (conn.state != ConnState::Freed).then(|| ConnId::new(index as u32, slot.generation))
            })
            .collect();

        let mut ready = Vec::new();
        {
            let mut ids = Vec::new();
            let mut pollfds = Vec::new();
            for fd in self.table.interested() {
                let Some(id) = self.table.lookup(fd) else {
                    continue;
                };
                let Some(socket) = self.conn(id).and_then(|c| c.socket.as_ref()) else {
                    continue;
                };
                let mut flags = PollFlags::empty();
                if self.table.wants_read(fd) {
                    flags |= PollFlags::POLLIN;
                }
                if self.table.wants_write(fd) {
                    flags |= PollFlags::POLLOUT;
                }
                pollfds.push(PollFd::new(socket.as_fd(), flags));
                ids.push(id);
            }

            if pollfds.is_empty() && forced.is_empty() && timeout.is_none() {
                // Nothing could ever wake us.
                return Ok(Vec::new());
            }
            let timeout = if forced.is_empty() {
                to_poll_timeout(timeout)
            } else {
                PollTimeout::ZERO
            };

            loop {
                match poll(&mut pollfds, timeout) {
                    Ok(_) => break,
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        error!(error = %e, "poll failed");
                        return Err(e.into());
                    }
                }
            }

            for (pfd, &id) in pollfds.iter().zip(&ids) {
                let Some(revents) = pfd.revents() else {
                    continue;
                };
                let failed = revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR);
                let readable = failed || revents.contains(PollFlags::POLLIN);
                let writable = failed || revents.contains(PollFlags::POLLOUT);
                if readable || writable {
                    ready.push(Event {
                        id,
                        readable,
                        writable,
                    });
                }
            }
        }

        for id in forced {
            match ready.iter_mut().find(|e| e.id == id) {
                Some(event) => event.readable = true,
                None => ready.push(Event {
                    id,
                    readable: true,
                    writable: false,
                }),
            }
        }
        Ok(ready)
    }

    fn dispatch(&mut self, event: Event) {
        let id = event.id;
        if event.writable {
            match self.state(id) {
                Some(ConnState::Connecting) => self.finish_connect(id),
                Some(ConnState::Connected) => self.flush_and_settle(id),
                _ => {}
            }
        }
        if event.readable {
            let Some((state, muted, requested)) = self
                .conn(id)
                .map(|c| (c.state, c.muted, c.disconnect_requested))
            else {
                return;
            };
            if muted {
                return;
            }
            match state {
                ConnState::Listener => self.accept_one(id),
                ConnState::Connected if !requested => {
                    self.fill_read_buffer(id);
                    self.dispatch_reads(id);
                    self.reclaim(id);
                }
                _ => {}
            }
        }
    }

    /// Send as much queued output as the socket takes, firing triggers as
    /// they come due.
    pub(super) fn flush(&mut self, id: ConnId) -> Flush {
        loop {
            let step = match self.conn_mut(id) {
                Some(conn) if conn.state == ConnState::Connected => flush_step(conn),
                _ => return Flush::Gone,
            };
            match step {
                Step::Sent { n, wanted } => {
                    if let Some(conn) = self.conn_mut(id) {
                        conn.bytes_written += n as u64;
                        if n > 0 {
                            conn.last_write = Instant::now();
                        }
                    }
                    if n < wanted {
                        self.sync_interest(id);
                        return Flush::Blocked;
                    }
                }
                Step::WouldBlock => {
                    self.sync_interest(id);
                    return Flush::Blocked;
                }
                Step::Trigger(token) => {
                    self.fire(id, CallbackKind::Trigger, Callbacks::trigger_slot, |io, cb| {
                        cb(io, id, token)
                    });
                }
                Step::Held => {
                    self.sync_interest(id);
                    return Flush::Held;
                }
                Step::Idle => {
                    self.reclaim(id);
                    self.sync_interest(id);
                    return Flush::Drained;
                }
                Step::Failed(e) => {
                    self.teardown(id, DisconnectCause::Remote, Some(e));
                    return Flush::Gone;
                }
            }
        }
    }

    /// Flush, then complete a deferred local disconnect if the output has
    /// drained.
    pub(super) fn flush_and_settle(&mut self, id: ConnId) {
        if self.flush(id) == Flush::Drained
            && self.conn(id).is_some_and(|c| c.disconnect_requested)
        {
            self.teardown(id, DisconnectCause::Local, None);
        }
    }

    /// Bounded read from the socket into the read buffer, growing it
    /// within budget when full.
    fn fill_read_buffer(&mut self, id: ConnId) {
        for _ in 0..MAX_READS_PER_PASS {
            let full = match self.conn(id) {
                Some(conn) if conn.state == ConnState::Connected => conn.rbuf.is_full(),
                _ => return,
            };
            if full && let Err(ceiling) = self.grow_buffer(id, Side::Read) {
                self.warn_over_limit(id, ceiling);
                if let Some(conn) = self.conn_mut(id) {
                    conn.read_stalled = true;
                }
                self.sync_interest(id);
                return;
            }

            let Some(conn) = self.conn_mut(id) else {
                return;
            };
            let Connection {
                socket,
                rbuf,
                bytes_read,
                ..
            } = conn;
            let Some(mut reader) = socket.as_ref() else {
                return;
            };
            let spare = rbuf.spare_mut();
            let wanted = spare.len();
            if wanted == 0 {
                return;
            }
            match reader.read(spare) {
                Ok(0) => {
                    self.teardown(id, DisconnectCause::Remote, None);
                    return;
                }
                Ok(n) => {
                    rbuf.commit(n);
                    *bytes_read += n as u64;
                    if n < wanted {
                        return;
                    }
                }
                Err(e) if is_transient(&e) => return,
                Err(e) => {
                    self.teardown(id, DisconnectCause::Remote, Some(e));
                    return;
                }
            }
        }
    }

    /// Run the read and line callbacks while they keep consuming input.
    fn dispatch_reads(&mut self, id: ConnId) {
        loop {
            let Some(conn) = self.conn(id) else {
                return;
            };
            if !accepting_input(conn) {
                return;
            }
            let before = conn.rbuf.len();
            if before == 0 {
                return;
            }
            if conn.callbacks.has(CallbackKind::Readable) {
                self.fire(id, CallbackKind::Readable, Callbacks::readable_slot, |io, cb| {
                    cb(io, id, before)
                });
            }

            let Some(conn) = self.conn_mut(id) else {
                return;
            };
            if !accepting_input(conn) {
                return;
            }
            let mut progressed = conn.rbuf.len() < before;
            if conn.callbacks.has(CallbackKind::Line)
                && let Some(line) = conn.rbuf.pop_line()
            {
                self.after_read(id);
                self.fire(id, CallbackKind::Line, Callbacks::line_slot, |io, cb| {
                    cb(io, id, &line)
                });
                progressed = true;
            }
            if !progressed {
                return;
            }
        }
    }

    fn expire_write_timeouts(&mut self, now: Instant) {
        let expired: Vec<(ConnId, ConnState, bool)> = self
            .live()
            .filter(|(_, c)| awaiting_output(c))
            .filter(|(_, c)| {
                c.write_timeout
                    .is_some_and(|t| now.saturating_duration_since(c.last_write) >= t)
            })
            .map(|(id, c)| (id, c.state, c.disconnect_requested))
            .collect();

        for (id, state, requested) in expired {
            debug!(conn = %id, pending = self.write_len(id), ?state, "write timeout");
            let err = io::Error::new(io::ErrorKind::TimedOut, "write timed out");
            let cause = match state {
                ConnState::Connecting => DisconnectCause::ConnectFailed,
                _ if requested => DisconnectCause::Local,
                _ => DisconnectCause::Remote,
            };
            self.teardown(id, cause, Some(err));
        }
    }

    /// Block until `id` can take more output, then flush it. Used by
    /// blocking-mode writes; nothing else on the reactor runs meanwhile.
    ///
    /// Returns `false` if the connection went away or timed out.
    pub(super) fn wait_writable(&mut self, id: ConnId) -> bool {
        let Some(write_timeout) = self.conn(id).map(|c| c.write_timeout) else {
            return false;
        };
        loop {
            let ready = {
                let Some(socket) = self
                    .conn(id)
                    .filter(|c| c.state == ConnState::Connected)
                    .and_then(|c| c.socket.as_ref())
                else {
                    return false;
                };
                let mut fds = [PollFd::new(socket.as_fd(), PollFlags::POLLOUT)];
                match poll(&mut fds, to_poll_timeout(write_timeout)) {
                    Ok(n) => n > 0,
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        warn!(conn = %id, error = %e, "poll failed during blocking write");
                        return false;
                    }
                }
            };
            if !ready {
                let err = io::Error::new(io::ErrorKind::TimedOut, "blocking write timed out");
                self.teardown(id, DisconnectCause::Remote, Some(err));
                return false;
            }
            return match self.flush(id) {
                Flush::Drained | Flush::Blocked => true,
                // Nothing more can leave until the running trigger handler
                // returns.
                Flush::Held | Flush::Gone => false,
            };
        }
    }
}

fn accepting_input(conn: &Connection) -> bool {
    conn.state == ConnState::Connected && !conn.muted && !conn.disconnect_requested
}

/// Queued output the write timeout applies to. Output queued while the
/// handshake is still in flight counts too.
fn awaiting_output(conn: &Connection) -> bool {
    matches!(conn.state, ConnState::Connecting | ConnState::Connected) && conn.has_pending_writes()
}
