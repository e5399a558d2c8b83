//! Connect, listen, accept and disconnect.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use super::{SockIo, invalid};
use crate::connection::{CallbackKind, Callbacks, ConnId, ConnState, Disconnect, DisconnectCause};
use crate::error::{SockError, is_in_progress, is_transient};

const LISTEN_BACKLOG: i32 = 128;

/// Resolve `host:port`, blocking the whole process while it runs.
fn resolve(host: &str, port: u16) -> Result<SocketAddr, SockError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|source| SockError::Resolve {
            host: host.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| SockError::NoAddress(host.to_string()))
}

/// Non-blocking, and on Apple targets immune to SIGPIPE (elsewhere sends
/// pass `MSG_NOSIGNAL`).
fn prepare(socket: &Socket) -> io::Result<()> {
    socket.set_nonblocking(true)?;
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "tvos", target_os = "watchos"))]
    socket.set_nosigpipe(true)?;
    Ok(())
}

fn new_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    prepare(&socket)?;
    Ok(socket)
}

impl SockIo {
    /// Start an outbound connection to `host:port`, optionally binding the
    /// local end to `bind` first.
    ///
    /// Name resolution is synchronous. If the connect completes at once the
    /// connect callback runs before this returns; otherwise it runs from
    /// `check_sockets`, or the disconnect callback runs with
    /// [`DisconnectCause::ConnectFailed`].
    ///
    /// May be called from the connection's own disconnect callback to
    /// reconnect it.
    pub fn connect(
        &mut self,
        id: ConnId,
        host: &str,
        port: u16,
        bind: Option<SocketAddr>,
    ) -> Result<(), SockError> {
        let state = self.conn(id).ok_or_else(|| invalid(id))?.state;
        if !matches!(state, ConnState::Unbound | ConnState::Disconnecting) {
            return Err(SockError::InUse(id));
        }
        self.ensure_buffers(id)?;

        let addr = resolve(host, port)?;
        let socket = new_socket(&addr)?;
        if let Some(local) = bind {
            socket.bind(&local.into())?;
        }
        let in_progress = match socket.connect(&addr.into()) {
            Ok(()) => false,
            Err(e) if is_in_progress(&e) => true,
            Err(source) => return Err(SockError::Connect { addr, source }),
        };

        let fd = socket.as_raw_fd();
        let state = if in_progress {
            ConnState::Connecting
        } else {
            ConnState::Connected
        };
        let Some(conn) = self.conn_mut(id) else {
            return Err(SockError::InvalidHandle(id));
        };
        conn.bind(socket, fd, Some(addr), state);
        self.table.register(fd, id, false);
        self.sync_interest(id);
        debug!(conn = %id, fd, %addr, in_progress, "connecting");

        if !in_progress {
            self.fire(id, CallbackKind::Connect, Callbacks::connect_slot, |io, cb| {
                cb(io, id)
            });
        }
        Ok(())
    }

    /// Resolve the outcome of a pending connect once the socket reports
    /// writable.
    pub(super) fn finish_connect(&mut self, id: ConnId) {
        let Some(socket) = self.conn(id).and_then(|c| c.socket.as_ref()) else {
            return;
        };
        let outcome = match socket.take_error() {
            Ok(None) => socket.peer_addr().map(|_| ()),
            Ok(Some(err)) | Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => {
                if let Some(conn) = self.conn_mut(id) {
                    conn.state = ConnState::Connected;
                }
                self.sync_interest(id);
                debug!(conn = %id, "connected");
                self.fire(id, CallbackKind::Connect, Callbacks::connect_slot, |io, cb| {
                    cb(io, id)
                });
            }
            Err(err) => {
                // peer_addr() reports ENOTCONN when the real error was lost.
                self.teardown(id, DisconnectCause::ConnectFailed, Some(err));
            }
        }
    }

    /// Turn `id` into a listener on `host:port` (all IPv4 interfaces when
    /// `host` is `None`). Returns the bound address, which tells the
    /// caller the real port when `port` is 0.
    ///
    /// Listeners hold no buffers.
    pub fn listen(&mut self, id: ConnId, host: Option<&str>, port: u16) -> Result<SocketAddr, SockError> {
        let state = self.conn(id).ok_or_else(|| invalid(id))?.state;
        if state != ConnState::Unbound {
            return Err(SockError::InUse(id));
        }

        let addr = match host {
            Some(host) => resolve(host, port)?,
            None => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        };
        let socket = new_socket(&addr)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        let local = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| SockError::NoAddress(addr.to_string()))?;

        let fd = socket.as_raw_fd();
        self.drop_buffers(id);
        let Some(conn) = self.conn_mut(id) else {
            return Err(SockError::InvalidHandle(id));
        };
        conn.bind(socket, fd, None, ConnState::Listener);
        self.table.register(fd, id, false);
        self.sync_interest(id);
        debug!(conn = %id, fd, %local, "listening");
        Ok(local)
    }

    /// Stop listening and close the descriptor. The connection returns to
    /// the unbound state with minimum-size buffers.
    pub fn close_listener(&mut self, id: ConnId) -> Result<(), SockError> {
        let state = self.conn(id).ok_or_else(|| invalid(id))?.state;
        if state != ConnState::Listener {
            return Err(SockError::NotListener(id));
        }
        self.teardown(id, DisconnectCause::Local, None);
        Ok(())
    }

    /// Accept one pending connection on listener `id`.
    ///
    /// Without an accept callback the new descriptor is closed at once.
    pub(super) fn accept_one(&mut self, id: ConnId) {
        let Some(listener) = self.conn(id) else {
            return;
        };
        let Some(socket) = listener.socket.as_ref() else {
            return;
        };
        let wants_accept = listener.callbacks.has(CallbackKind::Accept);

        let (socket, addr) = match socket.accept() {
            Ok(accepted) => accepted,
            Err(e) if is_transient(&e) => return,
            Err(e) => {
                warn!(listener = %id, error = %e, "accept failed");
                return;
            }
        };
        let remote = addr.as_socket();
        if !wants_accept {
            debug!(listener = %id, ?remote, "no accept handler, refusing connection");
            return;
        }
        if let Err(e) = prepare(&socket) {
            warn!(listener = %id, error = %e, "failed to configure accepted socket");
            return;
        }

        let new = match self.create() {
            Ok(new) => new,
            Err(e) => {
                warn!(listener = %id, ?remote, error = %e, "dropping accepted connection");
                return;
            }
        };
        let fd = socket.as_raw_fd();
        if let Some(conn) = self.conn_mut(new) {
            conn.bind(socket, fd, remote, ConnState::Connected);
            conn.engine_owned = true;
        }
        self.table.register(fd, new, false);
        self.sync_interest(new);
        debug!(listener = %id, conn = %new, fd, ?remote, "accepted");

        self.fire(id, CallbackKind::Accept, Callbacks::accept_slot, |io, cb| {
            cb(io, id, new)
        });
    }

    /// Close a connection.
    ///
    /// A connected socket with queued output is flushed first: if bytes
    /// remain, the close is deferred until they have been sent, so a
    /// caller may write a final message and disconnect straight away.
    /// Calling this again while a disconnect is pending or running is a
    /// no-op.
    pub fn disconnect(&mut self, id: ConnId) -> Result<(), SockError> {
        let conn = self.conn_mut(id).ok_or_else(|| invalid(id))?;
        match conn.state {
            ConnState::Unbound => Err(SockError::NotConnected(id)),
            ConnState::Disconnecting | ConnState::Freed => Ok(()),
            ConnState::Connecting | ConnState::Listener => {
                self.teardown(id, DisconnectCause::Local, None);
                Ok(())
            }
            ConnState::Connected => {
                if conn.disconnect_requested {
                    return Ok(());
                }
                if !conn.has_pending_writes() {
                    self.teardown(id, DisconnectCause::Local, None);
                    return Ok(());
                }
                conn.disconnect_requested = true;
                self.sync_interest(id);
                debug!(conn = %id, pending = self.write_len(id), "disconnect deferred until drained");
                self.flush_and_settle(id);
                Ok(())
            }
        }
    }

    /// Close the descriptor, drop queued output and run the disconnect
    /// callback. Runs at most once per binding: a nested call made while
    /// teardown is already in progress returns immediately.
    pub(crate) fn teardown(&mut self, id: ConnId, cause: DisconnectCause, error: Option<io::Error>) {
        let Some(conn) = self.conn_mut(id) else {
            return;
        };
        if !matches!(
            conn.state,
            ConnState::Connecting | ConnState::Connected | ConnState::Listener
        ) {
            return;
        }
        let was_listener = conn.state == ConnState::Listener;
        conn.state = ConnState::Disconnecting;
        conn.disconnect_requested = false;
        conn.muted = false;
        conn.force_read = false;
        conn.read_stalled = false;
        let dropped = conn.chunks.clear();
        conn.wbuf.clear();
        conn.rbuf.clear();
        let fd = conn.fd.take();
        // Close before the callback runs so it cannot act on a descriptor
        // number the kernel may already have handed to someone else.
        drop(conn.socket.take());
        if let Some(fd) = fd {
            self.table.unregister(fd);
        }

        if was_listener {
            if let Err(e) = self.ensure_buffers(id) {
                warn!(conn = %id, error = %e, "could not restore buffers after closing listener");
            }
        } else {
            self.reclaim(id);
        }

        match &error {
            Some(e) => debug!(conn = %id, ?fd, cause = cause.as_str(), error = %e, dropped, "disconnected"),
            None => debug!(conn = %id, ?fd, cause = cause.as_str(), dropped, "disconnected"),
        }

        let info = Disconnect { cause, error };
        self.fire(id, CallbackKind::Disconnect, Callbacks::disconnect_slot, |io, cb| {
            cb(io, id, &info)
        });

        let Some(conn) = self.conn_mut(id) else {
            return;
        };
        if conn.state != ConnState::Disconnecting {
            // Reconnected from the callback.
            return;
        }
        conn.state = ConnState::Unbound;
        if conn.engine_owned {
            if conn.callback_depth > 0 {
                conn.state = ConnState::Freed;
            } else {
                self.release(id);
            }
        }
    }
}
