//! Integration test common infrastructure.
//!
//! Spawns the slservices binary against a fake hub listening on loopback.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

/// A running services process and its scratch directory.
pub struct TestServices {
    child: Child,
    _dir: tempfile::TempDir,
}

impl TestServices {
    /// Spawn slservices linking to `127.0.0.1:<hub_port>`.
    pub fn spawn(hub_port: u16, reconnect_delay: u64) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let config_path = write_config(
            &dir,
            &format!(
                r#"
[services]
name = "services.test"
sid = "00S"
description = "Test Services"

[uplink]
host = "127.0.0.1"
port = {hub_port}
password = "linkpass"
reconnect_delay = {reconnect_delay}

[sockets]
read_timeout_ms = 50
"#
            ),
        )?;

        let child = Command::new(env!("CARGO_BIN_EXE_slservices"))
            .arg(&config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Self { child, _dir: dir })
    }
}

impl Drop for TestServices {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn write_config(dir: &tempfile::TempDir, content: &str) -> anyhow::Result<PathBuf> {
    let path = dir.path().join("slservices.toml");
    std::fs::write(&path, content)?;
    Ok(path)
}

/// The ircd side of the link.
pub struct FakeHub {
    listener: TcpListener,
}

impl FakeHub {
    pub fn bind() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Wait for the services to connect.
    pub fn accept(&self, within: Duration) -> anyhow::Result<HubLink> {
        let deadline = Instant::now() + within;
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => return HubLink::new(stream),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        anyhow::bail!("services did not connect within {within:?}");
                    }
                    sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// One accepted link, read line by line.
pub struct HubLink {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl HubLink {
    fn new(stream: TcpStream) -> anyhow::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    /// Next line without its terminator, or `None` at EOF.
    pub fn recv(&mut self) -> anyhow::Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    pub fn send(&mut self, line: &str) -> anyhow::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\r\n")?;
        Ok(())
    }
}
