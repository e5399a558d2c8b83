//! Shared helpers for loopback tests.
//!
//! Every test drives a real `SockIo` against std sockets on 127.0.0.1. The
//! engine runs on the test thread; peers that must read concurrently run
//! on a helper thread.

#![allow(dead_code)]

use std::cell::RefCell;
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::rc::Rc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use slirc_sockio::{Callback, ConnId, DisconnectCause, SockConfig, SockIo};

/// Engine with a short pass timeout so loops stay responsive.
pub fn engine() -> SockIo {
    SockIo::new(&SockConfig {
        read_timeout_ms: 20,
        ..SockConfig::default()
    })
}

/// Run passes until `done` holds, failing after five seconds.
pub fn pump_until(io: &mut SockIo, mut done: impl FnMut(&SockIo) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(io) {
        assert!(Instant::now() < deadline, "timed out waiting for the engine");
        io.check_sockets().expect("check_sockets failed");
    }
}

/// Run a fixed number of passes.
pub fn pump(io: &mut SockIo, passes: usize) {
    for _ in 0..passes {
        io.check_sockets().expect("check_sockets failed");
    }
}

/// Engine-side listener on an ephemeral loopback port.
pub fn listener(io: &mut SockIo) -> (ConnId, SocketAddr) {
    let id = io.create().expect("create listener");
    let addr = io.listen(id, Some("127.0.0.1"), 0).expect("listen");
    (id, addr)
}

/// Std listener for tests where the engine is the client.
pub fn peer_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind peer listener");
    let addr = listener.local_addr().expect("peer addr");
    (listener, addr)
}

/// Accept one connection and read it to EOF on a helper thread.
pub fn drain_peer(listener: TcpListener) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("peer accept");
        let mut data = Vec::new();
        stream.read_to_end(&mut data).expect("peer read");
        data
    })
}

pub fn connect_peer(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("peer connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("peer read timeout");
    stream
}

/// Record of disconnect callbacks: `(cause, io error kind)`.
pub type Disconnects = Rc<RefCell<Vec<(DisconnectCause, Option<std::io::ErrorKind>)>>>;

pub fn record_disconnects(io: &mut SockIo, id: ConnId) -> Disconnects {
    let seen: Disconnects = Rc::default();
    let sink = Rc::clone(&seen);
    io.set_callback(
        id,
        Callback::on_disconnect(move |_, _, info| {
            sink.borrow_mut()
                .push((info.cause, info.error.as_ref().map(|e| e.kind())));
        }),
    )
    .expect("set disconnect callback");
    seen
}

/// Lines delivered to a connection's line callback.
pub type Lines = Rc<RefCell<Vec<Vec<u8>>>>;
