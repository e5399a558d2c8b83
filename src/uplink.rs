//! Link to the hub ircd.
//!
//! The uplink owns a single engine connection. Everything happens in engine
//! callbacks: the TS6 introduction is queued on connect, keepalives are
//! answered as lines arrive, and a disconnect schedules the next attempt.
//! The main loop only has to call [`Uplink::tick`] between passes.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use slirc_sockio::{Callback, ConnId, DisconnectCause, SockError, SockIo};
use tracing::{debug, info, warn};

use crate::config::{Config, ServicesConfig, UplinkConfig};
use crate::telemetry::spans;

/// TS6 capabilities we announce.
const CAPABS: &str = "QS ENCAP EX IE";

/// Link bookkeeping shared with the engine callbacks.
#[derive(Debug, Default)]
pub struct LinkState {
    /// Connected and introduced.
    pub linked: bool,
    /// Successful connects since startup.
    pub links: u64,
    /// Lines received that were not handled here.
    pub unhandled: u64,
    /// When to try again after losing the link.
    pub retry_at: Option<Instant>,
}

struct Settings {
    services: ServicesConfig,
    uplink: UplinkConfig,
}

pub struct Uplink {
    conn: ConnId,
    settings: Rc<Settings>,
    state: Rc<RefCell<LinkState>>,
}

impl Uplink {
    /// Allocate the uplink connection and install its handlers. Does not
    /// connect; call [`start`](Self::start).
    pub fn new(io: &mut SockIo, config: &Config) -> Result<Self, SockError> {
        let conn = io.create()?;
        let settings = Rc::new(Settings {
            services: config.services.clone(),
            uplink: config.uplink.clone(),
        });
        let state = Rc::new(RefCell::new(LinkState::default()));

        io.set_write_timeout(conn, settings.uplink.write_timeout())?;

        let (s, st) = (Rc::clone(&settings), Rc::clone(&state));
        io.set_callback(conn, Callback::on_connect(move |io, id| on_connect(io, id, &s, &st)))?;

        let (s, st) = (Rc::clone(&settings), Rc::clone(&state));
        io.set_callback(
            conn,
            Callback::on_line(move |io, id, line| on_line(io, id, line, &s, &st)),
        )?;

        let (s, st) = (Rc::clone(&settings), Rc::clone(&state));
        io.set_callback(
            conn,
            Callback::on_disconnect(move |io, id, info| {
                let _span = spans::uplink(&s.uplink.host, s.uplink.port).entered();
                let (read, written) = io.rw_stats(id).unwrap_or_default();
                let cause = info.cause.as_str();
                match (&info.cause, &info.error) {
                    (DisconnectCause::Local, None) => info!(cause, read, written, "uplink closed"),
                    (_, Some(e)) => warn!(cause, error = %e, read, written, "uplink lost"),
                    (_, None) => warn!(cause, read, written, "uplink lost"),
                }
                let mut state = st.borrow_mut();
                state.linked = false;
                state.retry_at = Some(Instant::now() + s.uplink.reconnect_delay());
                debug!(delay = s.uplink.reconnect_delay, "relink scheduled");
            }),
        )?;

        Ok(Self {
            conn,
            settings,
            state,
        })
    }

    /// Begin connecting. A failure that happens before the attempt is
    /// under way (resolution, socket setup) schedules a retry.
    pub fn start(&self, io: &mut SockIo) {
        let uplink = &self.settings.uplink;
        let _span = spans::uplink(&uplink.host, uplink.port).entered();
        self.state.borrow_mut().retry_at = None;
        match io.connect(self.conn, &uplink.host, uplink.port, uplink.bind) {
            Ok(()) => info!("linking"),
            Err(e) => {
                warn!(error = %e, code = e.error_code(), "link attempt failed");
                self.state.borrow_mut().retry_at = Some(Instant::now() + uplink.reconnect_delay());
            }
        }
    }

    /// Start a scheduled relink once its time has come.
    pub fn tick(&self, io: &mut SockIo, now: Instant) {
        let due = self.state.borrow().retry_at.is_some_and(|at| at <= now);
        if due && !self.is_linked() {
            self.start(io);
        }
    }

    pub fn is_linked(&self) -> bool {
        self.state.borrow().linked
    }

    #[cfg(test)]
    pub fn state(&self) -> std::cell::Ref<'_, LinkState> {
        self.state.borrow()
    }
}

/// The TS6 server introduction, in sending order.
pub fn introduction(services: &ServicesConfig, password: &str, now: i64) -> [String; 4] {
    [
        format!("PASS {password} TS 6 :{}", services.sid),
        format!("CAPAB :{CAPABS}"),
        format!("SERVER {} 1 :{}", services.name, services.description),
        format!("SVINFO 6 6 0 :{now}"),
    ]
}

/// Split a raw line into `(prefix, command, params)`.
fn split_line(line: &str) -> (Option<&str>, &str, &str) {
    let line = line.trim_end_matches(['\r', '\n']);
    let (prefix, rest) = match line.strip_prefix(':') {
        Some(rest) => match rest.split_once(' ') {
            Some((prefix, rest)) => (Some(prefix), rest),
            None => (Some(rest), ""),
        },
        None => (None, line),
    };
    let rest = rest.trim_start_matches(' ');
    let (command, params) = rest.split_once(' ').unwrap_or((rest, ""));
    (prefix, command, params)
}

fn send(io: &mut SockIo, id: ConnId, line: &str) {
    let sent = io
        .write_str(id, line)
        .and_then(|_| io.write_str(id, "\r\n"));
    if let Err(e) = sent {
        warn!(error = %e, "failed to queue line to uplink");
    }
}

fn on_connect(io: &mut SockIo, id: ConnId, settings: &Settings, state: &RefCell<LinkState>) {
    let _span = spans::uplink(&settings.uplink.host, settings.uplink.port).entered();
    let now = chrono::Utc::now().timestamp();
    for line in introduction(&settings.services, &settings.uplink.password, now) {
        send(io, id, &line);
    }
    let mut state = state.borrow_mut();
    state.linked = true;
    state.links += 1;
    info!(
        name = %settings.services.name,
        sid = %settings.services.sid,
        remote = ?io.remote_addr(id),
        links = state.links,
        "uplink connected"
    );
}

fn on_line(io: &mut SockIo, id: ConnId, raw: &[u8], settings: &Settings, state: &RefCell<LinkState>) {
    let text = String::from_utf8_lossy(raw);
    let (prefix, command, params) = split_line(&text);
    match command {
        "" => {}
        "PING" => send(io, id, &format!("PONG {params}")),
        "ERROR" => {
            let _span = spans::uplink(&settings.uplink.host, settings.uplink.port).entered();
            warn!(reason = params.trim_start_matches(':'), "uplink sent ERROR");
            if let Err(e) = io.disconnect(id) {
                warn!(error = %e, "disconnect after ERROR failed");
            }
        }
        _ => {
            debug!(?prefix, command, params, "unhandled line from uplink");
            state.borrow_mut().unhandled += 1;
        }
    }
}
