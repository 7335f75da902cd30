// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use color_eyre::eyre::{Result, WrapErr, bail};
use rtems_tester_runner::{
    capture::{CaptureSource, OutputLength, OutputSink},
    monitor::MonitorEvent,
    tftp::{
        FileSource, Packet, TftpOption, TftpServer, TftpServerConfig, TftpServerHandle, TftpStats,
    },
};
use std::{
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    sync::{Mutex, Once, PoisonError},
    thread::JoinHandle,
    time::{Duration, Instant},
};

pub(crate) fn test_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = color_eyre::install();
    });
}

/// A TFTP server on an ephemeral loopback port, stopped on drop.
pub(crate) struct ServerFixture {
    pub(crate) dir: Utf8TempDir,
    pub(crate) addr: SocketAddr,
    pub(crate) handle: TftpServerHandle,
    thread: Option<JoinHandle<()>>,
}

impl ServerFixture {
    /// Serves `image` as the forced file.
    pub(crate) fn forced(image: &[u8], resend_limit: u32, sessions: Option<u32>) -> Result<Self> {
        let dir = Utf8TempDir::new()?;
        let path = dir.path().join("image.exe");
        std::fs::write(&path, image)?;
        Self::start(dir, FileSource::Forced(path), resend_limit, sessions)
    }

    /// Serves files from a fresh root directory.
    pub(crate) fn root() -> Result<Self> {
        let dir = Utf8TempDir::new()?;
        let root = dir.path().to_owned();
        Self::start(dir, FileSource::Root(root), 3, None)
    }

    fn start(
        dir: Utf8TempDir,
        source: FileSource,
        resend_limit: u32,
        sessions: Option<u32>,
    ) -> Result<Self> {
        let server = TftpServer::bind(TftpServerConfig {
            bind: (Ipv4Addr::LOCALHOST, 0).into(),
            source,
            resend_limit,
            timeout: Duration::from_secs(1),
            sessions,
        })?;
        let addr = server.local_addr();
        let (handle, thread) = server.spawn()?;
        Ok(Self {
            dir,
            addr,
            handle,
            thread: Some(thread),
        })
    }

    pub(crate) fn root_path(&self) -> &Utf8Path {
        self.dir.path()
    }

    /// Waits until the server's counters satisfy `f`.
    pub(crate) fn wait_for_stats(&self, f: impl Fn(&TftpStats) -> bool) -> Result<TftpStats> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let stats = self.handle.stats();
            if f(&stats) {
                return Ok(stats);
            }
            if Instant::now() > deadline {
                bail!("timed out waiting for server stats, last: {stats:?}");
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for ServerFixture {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A sink standing in for a board's console: tests feed it activity by hand.
#[derive(Debug, Default)]
pub(crate) struct ConsoleSink {
    pub(crate) length: OutputLength,
    events: Mutex<Vec<MonitorEvent>>,
}

impl ConsoleSink {
    pub(crate) fn events(&self) -> Vec<MonitorEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl OutputSink for ConsoleSink {
    fn capture_line(&self, _source: CaptureSource, _line: &str) {}

    fn note_activity(&self, bytes: usize) {
        self.length.add(bytes);
    }

    fn output_length(&self) -> u64 {
        self.length.get()
    }

    fn monitor_fired(&self, event: MonitorEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// A minimal TFTP client.
pub(crate) struct TftpClient {
    socket: UdpSocket,
}

impl TftpClient {
    pub(crate) fn new() -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
        socket.set_read_timeout(Some(Duration::from_secs(5)))?;
        Ok(Self { socket })
    }

    pub(crate) fn read_request(
        &self,
        server: SocketAddr,
        filename: &str,
        options: Vec<TftpOption>,
    ) -> Result<()> {
        self.send(
            server,
            &Packet::ReadRequest {
                filename: filename.to_owned(),
                mode: "octet".to_owned(),
                options,
            },
        )
    }

    pub(crate) fn send(&self, to: SocketAddr, packet: &Packet) -> Result<()> {
        self.socket.send_to(&packet.encode(), to)?;
        Ok(())
    }

    pub(crate) fn recv(&self) -> Result<(Packet, SocketAddr)> {
        let mut buf = vec![0u8; 65536];
        let (len, from) = self
            .socket
            .recv_from(&mut buf)
            .wrap_err("no reply from server")?;
        Ok((Packet::parse(&buf[..len])?, from))
    }

    /// Runs a whole read of `filename`, returning the data and the number of DATA blocks.
    pub(crate) fn fetch(
        &self,
        server: SocketAddr,
        filename: &str,
        block_size: usize,
    ) -> Result<(Vec<u8>, usize)> {
        self.read_request(server, filename, Vec::new())?;
        self.receive_blocks(block_size, 1)
    }

    /// Receives DATA blocks starting at `first`, acknowledging each, until a short block.
    pub(crate) fn receive_blocks(&self, block_size: usize, first: u16) -> Result<(Vec<u8>, usize)> {
        let mut contents = Vec::new();
        let mut blocks = 0;
        let mut expected = first;
        loop {
            let (packet, from) = self.recv()?;
            let Packet::Data { block, data } = packet else {
                bail!("expected DATA {expected}, got {packet}");
            };
            if block != expected {
                bail!("expected DATA {expected}, got DATA {block}");
            }
            contents.extend_from_slice(&data);
            blocks += 1;
            self.send(from, &Packet::Ack { block })?;
            if data.len() < block_size {
                return Ok((contents, blocks));
            }
            expected = expected.wrapping_add(1);
        }
    }
}

/// Writes an executable shell script.
#[cfg(unix)]
pub(crate) fn write_script(dir: &Utf8Path, name: &str, body: &str) -> Result<Utf8PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}"))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}
