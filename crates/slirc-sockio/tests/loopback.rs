//! End-to-end data flow over loopback sockets.

mod common;

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::rc::Rc;

use bytes::Bytes;
use common::{Lines, connect_peer, drain_peer, engine, listener, peer_listener, pump, pump_until};
use slirc_sockio::{Callback, ConnId, ConnState, MIN_BUFFER, SockError, SockIo};

/// Accept handler that records lines on every accepted connection.
fn collect_lines(io: &mut slirc_sockio::SockIo, listener: ConnId) -> (Lines, Rc<Cell<Option<ConnId>>>) {
    let lines: Lines = Rc::default();
    let accepted = Rc::new(Cell::new(None));
    let (sink, slot) = (Rc::clone(&lines), Rc::clone(&accepted));
    io.set_callback(
        listener,
        Callback::on_accept(move |io, _, new| {
            slot.set(Some(new));
            let sink = Rc::clone(&sink);
            io.set_callback(
                new,
                Callback::on_line(move |_, _, line| sink.borrow_mut().push(line.to_vec())),
            )
            .expect("set line callback");
        }),
    )
    .expect("set accept callback");
    (lines, accepted)
}

#[test]
fn lines_are_split_across_buffer_growth() {
    let mut io = engine();
    let (lid, addr) = listener(&mut io);
    let (lines, accepted) = collect_lines(&mut io, lid);

    let mut peer = connect_peer(addr);
    let long = vec![b'x'; 4096];
    peer.write_all(b"PING\n").unwrap();
    peer.write_all(&long).unwrap();
    peer.write_all(b"more\n").unwrap();

    pump_until(&mut io, |_| lines.borrow().len() == 2);

    let lines = lines.borrow();
    assert_eq!(lines[0], b"PING\n");
    assert_eq!(lines[1].len(), 4096 + 5);
    assert!(lines[1].ends_with(b"xmore\n"));

    let conn = accepted.get().expect("accepted");
    assert_eq!(io.read_len(conn), 0);
    assert_eq!(io.rw_stats(conn).unwrap(), (4106, 0));
    assert_eq!(io.remote_addr(conn), Some(peer.local_addr().unwrap()));
}

#[test]
fn line_handler_can_reply() {
    let mut io = engine();
    let (lid, addr) = listener(&mut io);
    io.set_callback(
        lid,
        Callback::on_accept(|io, _, new| {
            io.set_callback(
                new,
                Callback::on_line(|io, id, line| {
                    if line.starts_with(b"PING ") {
                        let token = String::from_utf8_lossy(&line[5..]).trim_end().to_string();
                        io.write_formatted(id, format_args!("PONG {token}\r\n")).unwrap();
                    }
                }),
            )
            .unwrap();
        }),
    )
    .unwrap();

    let mut peer = connect_peer(addr);
    peer.write_all(b"PING :abc\r\n").unwrap();

    let mut reply = Vec::new();
    let mut buf = [0u8; 64];
    peer.set_nonblocking(true).unwrap();
    pump_until(&mut io, |_| {
        if let Ok(n) = peer.read(&mut buf) {
            reply.extend_from_slice(&buf[..n]);
        }
        reply.ends_with(b"\r\n")
    });
    assert_eq!(reply, b"PONG :abc\r\n");
}

#[test]
fn readable_handler_consumes_bytes_directly() {
    let mut io = engine();
    let (lid, addr) = listener(&mut io);
    let got = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&got);
    io.set_callback(
        lid,
        Callback::on_accept(move |io, _, new| {
            let sink = Rc::clone(&sink);
            io.set_callback(
                new,
                Callback::on_readable(move |io, id, available| {
                    let mut buf = vec![0u8; available];
                    let n = io.read_bytes(id, &mut buf).unwrap();
                    sink.borrow_mut().extend_from_slice(&buf[..n]);
                }),
            )
            .unwrap();
        }),
    )
    .unwrap();

    let mut peer = connect_peer(addr);
    peer.write_all(b"\x01\x02binary\x00").unwrap();
    pump_until(&mut io, |_| got.borrow().len() == 9);
    assert_eq!(&got.borrow()[..], b"\x01\x02binary\x00");
}

#[test]
fn triggers_fire_after_preceding_bytes_are_sent() {
    let mut io = engine();
    let (peer, addr) = peer_listener();
    let reader = drain_peer(peer);

    let id = io.create().unwrap();
    let fired = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&fired);
    io.set_callback(
        id,
        Callback::on_trigger(move |io, id, token| {
            let (_, written) = io.rw_stats(id).unwrap();
            sink.borrow_mut().push((token, written));
        }),
    )
    .unwrap();

    io.connect(id, "127.0.0.1", addr.port(), None).unwrap();
    io.write_str(id, "abc").unwrap();
    io.write_trigger(id, 1).unwrap();
    io.write_span(id, Bytes::from_static(b"defg")).unwrap();
    io.write_str(id, "hi").unwrap();
    io.write_trigger(id, 2).unwrap();
    assert_eq!(io.write_len(id), 9);

    pump_until(&mut io, |_| fired.borrow().len() == 2);
    assert_eq!(*fired.borrow(), vec![(1, 3), (2, 9)]);

    io.disconnect(id).unwrap();
    assert_eq!(reader.join().unwrap(), b"abcdefghi");
}

#[test]
fn disconnect_from_trigger_handler_still_fires_later_triggers() {
    let mut io = engine();
    let (peer, addr) = peer_listener();
    let reader = drain_peer(peer);

    let id = io.create().unwrap();
    let disconnects = common::record_disconnects(&mut io, id);
    let fired = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&fired);
    io.set_callback(
        id,
        Callback::on_trigger(move |io, id, token| {
            sink.borrow_mut().push(token);
            if token == 1 {
                // "b" and trigger 2 are still queued, so this defers and
                // flushes them from inside the running handler.
                io.disconnect(id).unwrap();
            }
        }),
    )
    .unwrap();

    io.connect(id, "127.0.0.1", addr.port(), None).unwrap();
    io.write_str(id, "a").unwrap();
    io.write_trigger(id, 1).unwrap();
    io.write_str(id, "b").unwrap();
    io.write_trigger(id, 2).unwrap();

    pump_until(&mut io, |_| !disconnects.borrow().is_empty());
    pump(&mut io, 2);

    assert_eq!(*fired.borrow(), vec![1, 2]);
    assert_eq!(
        *disconnects.borrow(),
        vec![(slirc_sockio::DisconnectCause::Local, None)]
    );
    assert_eq!(io.state(id), Some(ConnState::Unbound));
    assert_eq!(reader.join().unwrap(), b"ab");
}

#[test]
fn local_disconnect_flushes_queued_output() {
    const TOTAL: usize = 1 << 20;
    let mut io = engine();
    let (peer, addr) = peer_listener();
    let reader = drain_peer(peer);

    let id = io.create().unwrap();
    let disconnects = common::record_disconnects(&mut io, id);
    io.connect(id, "127.0.0.1", addr.port(), None).unwrap();
    pump_until(&mut io, |io| io.is_connected(id));

    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
    assert_eq!(io.write_bytes(id, &payload).unwrap(), TOTAL);
    io.disconnect(id).unwrap();

    pump_until(&mut io, |_| !disconnects.borrow().is_empty());
    pump(&mut io, 2);

    assert_eq!(
        *disconnects.borrow(),
        vec![(slirc_sockio::DisconnectCause::Local, None)]
    );
    assert_eq!(io.state(id), Some(ConnState::Unbound));
    let received = reader.join().unwrap();
    assert_eq!(received.len(), TOTAL);
    assert_eq!(received, payload);
    assert_eq!(io.rw_stats(id).unwrap().1, TOTAL as u64);
}

#[test]
fn writes_stop_short_at_the_connection_ceiling() {
    let mut io = engine();
    io.set_buffer_limits(16_384, 0);
    let (_peer, addr) = peer_listener();

    let id = io.create().unwrap();
    io.connect(id, "127.0.0.1", addr.port(), None).unwrap();
    let written = io.write_bytes(id, &[b'z'; 100_000]).unwrap();
    assert!(written < 100_000, "expected a short write, got {written}");
    assert!(written >= 4095);
    assert!(io.buffer_stats(id).unwrap().connection_bytes <= 16_384);
    assert!(matches!(
        io.state(id),
        Some(ConnState::Connecting | ConnState::Connected)
    ));
}

#[test]
fn blocking_writes_wait_for_the_socket() {
    const TOTAL: usize = 200_000;
    let mut io = engine();
    io.set_buffer_limits(16_384, 0);
    let (peer, addr) = peer_listener();
    let reader = drain_peer(peer);

    let id = io.create().unwrap();
    io.connect(id, "127.0.0.1", addr.port(), None).unwrap();
    pump_until(&mut io, |io| io.is_connected(id));
    io.set_blocking(id, true).unwrap();

    assert_eq!(io.write_bytes(id, &[b'q'; TOTAL]).unwrap(), TOTAL);
    io.disconnect(id).unwrap();
    pump_until(&mut io, |io| io.state(id) == Some(ConnState::Unbound));
    assert_eq!(reader.join().unwrap().len(), TOTAL);
}

#[test]
fn reads_and_writes_fail_on_stale_handles() {
    let mut io = engine();
    let id = io.create().unwrap();
    io.free(id).unwrap();
    assert!(matches!(io.read_line(id), Err(SockError::InvalidHandle(_))));
    assert!(matches!(io.write_str(id, "x"), Err(SockError::InvalidHandle(_))));
    assert!(matches!(io.disconnect(id), Err(SockError::InvalidHandle(_))));
}

#[test]
fn buffer_total_tracks_growth_and_reclaim_across_connections() {
    let mut io = engine();
    let (peer_a, addr_a) = peer_listener();
    let (peer_b, addr_b) = peer_listener();

    let a = io.create().unwrap();
    let b = io.create().unwrap();
    io.connect(a, "127.0.0.1", addr_a.port(), None).unwrap();
    io.connect(b, "127.0.0.1", addr_b.port(), None).unwrap();
    pump_until(&mut io, |io| io.is_connected(a) && io.is_connected(b));

    let sum = |io: &SockIo| {
        [a, b]
            .iter()
            .map(|&id| io.buffer_stats(id).unwrap().connection_bytes)
            .sum::<usize>()
    };
    let baseline = io.total_buffer_bytes();
    assert_eq!(baseline, 4 * MIN_BUFFER);
    assert_eq!(sum(&io), baseline);

    // `a` grows with no limits in place.
    let payload = vec![b'x'; 100_000];
    assert_eq!(io.write_bytes(a, &payload[..30_000]).unwrap(), 30_000);
    let after_a = io.total_buffer_bytes();
    assert!(after_a > baseline);
    assert_eq!(sum(&io), after_a);

    // Leave `b` 20 000 bytes of process-wide room and a per-connection
    // limit it cannot reach with that.
    let per_connection = 256 * 1024;
    let total_limit = after_a + 20_000;
    io.set_buffer_limits(per_connection, total_limit);

    let written_b = io.write_bytes(b, &payload).unwrap();
    assert!(written_b < payload.len());
    assert!(written_b > 2 * MIN_BUFFER);
    let stats_b = io.buffer_stats(b).unwrap();
    assert_eq!(stats_b.total_bytes, total_limit);
    assert_eq!(stats_b.connection_bytes, 2 * MIN_BUFFER + 20_000);
    assert!(stats_b.connection_bytes < per_connection);
    assert_eq!(io.total_buffer_bytes(), sum(&io));

    // `a` holds the rest of the room; it cannot grow either.
    let a_bytes = io.buffer_stats(a).unwrap().connection_bytes;
    assert!(io.write_bytes(a, &payload).unwrap() < payload.len());
    assert_eq!(io.buffer_stats(a).unwrap().connection_bytes, a_bytes);

    // Draining shrinks both connections back to the minimum.
    let reader_a = drain_peer(peer_a);
    let reader_b = drain_peer(peer_b);
    pump_until(&mut io, |io| io.write_len(a) == 0 && io.write_len(b) == 0);
    assert_eq!(io.total_buffer_bytes(), 4 * MIN_BUFFER);
    assert_eq!(sum(&io), io.total_buffer_bytes());

    io.disconnect(a).unwrap();
    io.disconnect(b).unwrap();
    assert_eq!(reader_b.join().unwrap().len(), written_b);
    assert!(reader_a.join().unwrap().len() >= 30_000);
}
