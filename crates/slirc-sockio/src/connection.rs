//! Connection record, handles, disconnect causes and callback slots.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use socket2::Socket;

use crate::chunk::{TriggerToken, WriteQueue};
use crate::engine::SockIo;
use crate::ring::RingBuffer;

/// Generation-checked handle to a connection owned by a [`SockIo`].
///
/// A handle stays valid until the connection is freed; after that every
/// call made with it fails with [`SockError::InvalidHandle`](crate::SockError),
/// even if the slot is later reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    index: u32,
    generation: u32,
}

impl ConnId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub(crate) fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No descriptor attached.
    Unbound,
    /// Outbound connect in flight.
    Connecting,
    Connected,
    Listener,
    /// Teardown in progress; the disconnect callback is running.
    Disconnecting,
    /// Freed from inside one of its own callbacks; released when the
    /// outermost callback returns.
    Freed,
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Requested by this side.
    Local,
    /// Peer closed the connection or the socket failed.
    Remote,
    /// An outbound connect did not complete.
    ConnectFailed,
}

impl DisconnectCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::ConnectFailed => "connect_failed",
        }
    }
}

/// Passed to the disconnect callback.
#[derive(Debug)]
pub struct Disconnect {
    pub cause: DisconnectCause,
    /// The error behind a remote or failed disconnect, if there was one.
    pub error: Option<io::Error>,
}

impl Disconnect {
    /// Raw OS error code of the underlying failure.
    pub fn os_error(&self) -> Option<i32> {
        self.error.as_ref().and_then(io::Error::raw_os_error)
    }
}

pub type OnConnect = Box<dyn FnMut(&mut SockIo, ConnId)>;
pub type OnDisconnect = Box<dyn FnMut(&mut SockIo, ConnId, &Disconnect)>;
/// Called on the listener with the newly accepted connection.
pub type OnAccept = Box<dyn FnMut(&mut SockIo, ConnId, ConnId)>;
/// Called with the number of bytes waiting in the read buffer.
pub type OnReadable = Box<dyn FnMut(&mut SockIo, ConnId, usize)>;
/// Called with one complete line, terminator included.
pub type OnLine = Box<dyn FnMut(&mut SockIo, ConnId, &[u8])>;
pub type OnTrigger = Box<dyn FnMut(&mut SockIo, ConnId, TriggerToken)>;

/// One of the six callback slots, with its handler.
pub enum Callback {
    Connect(OnConnect),
    Disconnect(OnDisconnect),
    Accept(OnAccept),
    Readable(OnReadable),
    Line(OnLine),
    Trigger(OnTrigger),
}

impl Callback {
    pub fn on_connect(f: impl FnMut(&mut SockIo, ConnId) + 'static) -> Self {
        Self::Connect(Box::new(f))
    }

    pub fn on_disconnect(f: impl FnMut(&mut SockIo, ConnId, &Disconnect) + 'static) -> Self {
        Self::Disconnect(Box::new(f))
    }

    pub fn on_accept(f: impl FnMut(&mut SockIo, ConnId, ConnId) + 'static) -> Self {
        Self::Accept(Box::new(f))
    }

    pub fn on_readable(f: impl FnMut(&mut SockIo, ConnId, usize) + 'static) -> Self {
        Self::Readable(Box::new(f))
    }

    pub fn on_line(f: impl FnMut(&mut SockIo, ConnId, &[u8]) + 'static) -> Self {
        Self::Line(Box::new(f))
    }

    pub fn on_trigger(f: impl FnMut(&mut SockIo, ConnId, TriggerToken) + 'static) -> Self {
        Self::Trigger(Box::new(f))
    }

    pub fn kind(&self) -> CallbackKind {
        match self {
            Self::Connect(_) => CallbackKind::Connect,
            Self::Disconnect(_) => CallbackKind::Disconnect,
            Self::Accept(_) => CallbackKind::Accept,
            Self::Readable(_) => CallbackKind::Readable,
            Self::Line(_) => CallbackKind::Line,
            Self::Trigger(_) => CallbackKind::Trigger,
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callback").field(&self.kind()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Connect,
    Disconnect,
    Accept,
    Readable,
    Line,
    Trigger,
}

impl CallbackKind {
    #[inline]
    fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// The six slots. A slot is empty while its handler runs; `running` marks
/// those slots, and `touched` records slots replaced or cleared during that
/// time so the running handler is not put back over the change.
#[derive(Default)]
pub(crate) struct Callbacks {
    on_connect: Option<OnConnect>,
    on_disconnect: Option<OnDisconnect>,
    on_accept: Option<OnAccept>,
    on_readable: Option<OnReadable>,
    on_line: Option<OnLine>,
    on_trigger: Option<OnTrigger>,
    running: u8,
    touched: u8,
}

impl Callbacks {
    pub(crate) fn set(&mut self, callback: Callback) {
        self.touched |= callback.kind().bit();
        match callback {
            Callback::Connect(f) => self.on_connect = Some(f),
            Callback::Disconnect(f) => self.on_disconnect = Some(f),
            Callback::Accept(f) => self.on_accept = Some(f),
            Callback::Readable(f) => self.on_readable = Some(f),
            Callback::Line(f) => self.on_line = Some(f),
            Callback::Trigger(f) => self.on_trigger = Some(f),
        }
    }

    pub(crate) fn clear(&mut self, kind: CallbackKind) {
        self.touched |= kind.bit();
        match kind {
            CallbackKind::Connect => self.on_connect = None,
            CallbackKind::Disconnect => self.on_disconnect = None,
            CallbackKind::Accept => self.on_accept = None,
            CallbackKind::Readable => self.on_readable = None,
            CallbackKind::Line => self.on_line = None,
            CallbackKind::Trigger => self.on_trigger = None,
        }
    }

    pub(crate) fn has(&self, kind: CallbackKind) -> bool {
        match kind {
            CallbackKind::Connect => self.on_connect.is_some(),
            CallbackKind::Disconnect => self.on_disconnect.is_some(),
            CallbackKind::Accept => self.on_accept.is_some(),
            CallbackKind::Readable => self.on_readable.is_some(),
            CallbackKind::Line => self.on_line.is_some(),
            CallbackKind::Trigger => self.on_trigger.is_some(),
        }
    }

    /// Take a handler out for the duration of its call.
    pub(crate) fn take<T>(&mut self, kind: CallbackKind, slot: SlotFn<T>) -> Option<T> {
        let cb = slot(self).take()?;
        self.touched &= !kind.bit();
        self.running |= kind.bit();
        Some(cb)
    }

    /// Whether a handler of this kind is mid-call.
    pub(crate) fn is_running(&self, kind: CallbackKind) -> bool {
        self.running & kind.bit() != 0
    }

    /// Put a handler back unless its slot was changed while it ran.
    pub(crate) fn restore<T>(&mut self, kind: CallbackKind, slot: SlotFn<T>, cb: T) {
        self.running &= !kind.bit();
        if self.touched & kind.bit() == 0 {
            let entry = slot(self);
            if entry.is_none() {
                *entry = Some(cb);
            }
        }
    }

    pub(crate) fn connect_slot(&mut self) -> &mut Option<OnConnect> {
        &mut self.on_connect
    }

    pub(crate) fn disconnect_slot(&mut self) -> &mut Option<OnDisconnect> {
        &mut self.on_disconnect
    }

    pub(crate) fn accept_slot(&mut self) -> &mut Option<OnAccept> {
        &mut self.on_accept
    }

    pub(crate) fn readable_slot(&mut self) -> &mut Option<OnReadable> {
        &mut self.on_readable
    }

    pub(crate) fn line_slot(&mut self) -> &mut Option<OnLine> {
        &mut self.on_line
    }

    pub(crate) fn trigger_slot(&mut self) -> &mut Option<OnTrigger> {
        &mut self.on_trigger
    }
}

pub(crate) type SlotFn<T> = fn(&mut Callbacks) -> &mut Option<T>;

/// Per-socket state.
pub(crate) struct Connection {
    pub(crate) socket: Option<Socket>,
    pub(crate) fd: Option<RawFd>,
    pub(crate) remote: Option<SocketAddr>,
    pub(crate) state: ConnState,
    pub(crate) rbuf: RingBuffer,
    pub(crate) wbuf: RingBuffer,
    pub(crate) chunks: WriteQueue,
    pub(crate) callbacks: Callbacks,
    pub(crate) muted: bool,
    pub(crate) blocking: bool,
    pub(crate) disconnect_requested: bool,
    /// Unmuted since the last pass; read once even without an OS event.
    pub(crate) force_read: bool,
    /// Read buffer is full and cannot grow; stop polling for input until
    /// the consumer drains some of it.
    pub(crate) read_stalled: bool,
    /// The over-limit warning has been logged for this connection.
    pub(crate) warned: bool,
    /// Produced by accept; the engine frees it after disconnect.
    pub(crate) engine_owned: bool,
    pub(crate) callback_depth: u32,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) last_write: Instant,
    pub(crate) bytes_read: u64,
    pub(crate) bytes_written: u64,
}

impl Connection {
    pub(crate) fn new(min_buffer: usize) -> Self {
        Self {
            socket: None,
            fd: None,
            remote: None,
            state: ConnState::Unbound,
            rbuf: RingBuffer::with_capacity(min_buffer),
            wbuf: RingBuffer::with_capacity(min_buffer),
            chunks: WriteQueue::new(),
            callbacks: Callbacks::default(),
            muted: false,
            blocking: false,
            disconnect_requested: false,
            force_read: false,
            read_stalled: false,
            warned: false,
            engine_owned: false,
            callback_depth: 0,
            write_timeout: None,
            last_write: Instant::now(),
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Combined capacity of both buffers.
    #[inline]
    pub(crate) fn buffer_bytes(&self) -> usize {
        self.rbuf.capacity() + self.wbuf.capacity()
    }

    #[inline]
    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.wbuf.is_empty() || !self.chunks.is_empty()
    }

    #[inline]
    pub(crate) fn pending_write_bytes(&self) -> usize {
        self.wbuf.len() + self.chunks.pending_bytes()
    }

    pub(crate) fn wants_read(&self) -> bool {
        match self.state {
            ConnState::Listener => !self.muted,
            ConnState::Connected => !self.muted && !self.disconnect_requested && !self.read_stalled,
            _ => false,
        }
    }

    pub(crate) fn wants_write(&self) -> bool {
        match self.state {
            ConnState::Connecting => true,
            ConnState::Connected => self.has_pending_writes(),
            _ => false,
        }
    }

    /// Reset per-binding state when a descriptor is attached.
    pub(crate) fn bind(&mut self, socket: Socket, fd: RawFd, remote: Option<SocketAddr>, state: ConnState) {
        self.socket = Some(socket);
        self.fd = Some(fd);
        self.remote = remote;
        self.state = state;
        self.muted = false;
        self.disconnect_requested = false;
        self.force_read = false;
        self.read_stalled = false;
        self.warned = false;
        self.last_write = Instant::now();
        self.bytes_read = 0;
        self.bytes_written = 0;
        self.rbuf.clear();
        self.wbuf.clear();
        self.chunks.clear();
    }
}
