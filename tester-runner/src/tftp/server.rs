// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A read-only TFTP server that serves one session at a time.

use super::packet::{ErrorCode, Packet, TftpOption};
use crate::{errors::TftpServerError, helpers::lock};
use bytes::Bytes;
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};
use tracing::{debug, info, trace, warn};

/// The default block size (RFC 1350).
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// The range of block sizes accepted through the `blksize` option (RFC 2348).
pub const BLOCK_SIZE_RANGE: std::ops::RangeInclusive<u16> = 8..=65464;

/// The range of timeouts, in seconds, accepted through the `timeout` option (RFC 2349).
pub const TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 1..=255;

/// Added to the negotiated timeout before a block is resent.
const TIMEOUT_GUARD: Duration = Duration::from_millis(500);

/// How often blocked reads wake up to check for a stop request.
const POLL_STEP: Duration = Duration::from_millis(250);

/// Large enough for any request or acknowledgement.
const RECV_BUFFER_SIZE: usize = 65536;

/// Which file a read request is answered with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FileSource {
    /// Always this file, whatever the client asks for.
    Forced(Utf8PathBuf),

    /// The requested file, relative to this directory.
    Root(Utf8PathBuf),
}

/// Configuration for a [`TftpServer`].
#[derive(Clone, Debug)]
pub struct TftpServerConfig {
    /// The address to listen on.
    pub bind: SocketAddr,

    /// Where files come from.
    pub source: FileSource,

    /// How many times a block is resent before the session is abandoned.
    pub resend_limit: u32,

    /// The acknowledgement timeout when the client doesn't negotiate one.
    pub timeout: Duration,

    /// How many sessions to serve; `None` for no limit. More can be allowed with
    /// [`TftpServerHandle::arm`].
    pub sessions: Option<u32>,
}

/// Counters kept by a server.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TftpStats {
    /// Sessions that were started.
    pub sessions_started: u32,
    /// Sessions that transferred the whole file.
    pub sessions_completed: u32,
    /// Sessions that ended with an error.
    pub sessions_failed: u32,
    /// Requests refused because no session was armed.
    pub requests_refused: u32,
    /// DATA packets sent, including resends.
    pub blocks_sent: u64,
    /// DATA packets resent.
    pub resends: u64,
}

#[derive(Debug)]
struct ServerState {
    /// Set while a session is active; at most one is.
    busy: bool,
    armed: Option<u32>,
    stats: TftpStats,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<ServerState>,
    stopped: AtomicBool,
    wake_addr: SocketAddr,
}

/// A handle to a running server.
#[derive(Clone, Debug)]
pub struct TftpServerHandle {
    shared: Arc<Shared>,
}

impl TftpServerHandle {
    /// Asks the server to stop. Returns once the request is sent; a session in progress is
    /// abandoned at its next poll.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("stopping TFTP server");
        // Wake the listener out of its read.
        let unspecified: SocketAddr = match self.shared.wake_addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        if let Ok(socket) = UdpSocket::bind(unspecified) {
            let _ = socket.send_to(&[], self.shared.wake_addr);
        }
    }

    /// Returns true if [`stop`](Self::stop) was called.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Allows one more session to be served.
    pub fn arm(&self) {
        let mut state = lock(&self.shared.state);
        if let Some(armed) = &mut state.armed {
            *armed += 1;
        }
    }

    /// Whether a session is in progress.
    pub fn is_busy(&self) -> bool {
        lock(&self.shared.state).busy
    }

    /// Returns the server's counters.
    pub fn stats(&self) -> TftpStats {
        lock(&self.shared.state).stats
    }
}

/// A TFTP server bound to its listening port.
#[derive(Debug)]
pub struct TftpServer {
    listener: UdpSocket,
    local_addr: SocketAddr,
    config: TftpServerConfig,
    shared: Arc<Shared>,
}

impl TftpServer {
    /// Binds the listening socket.
    pub fn bind(config: TftpServerConfig) -> Result<Self, TftpServerError> {
        if let FileSource::Forced(path) = &config.source {
            if !path.is_file() {
                return Err(TftpServerError::ImageNotFound { path: path.clone() });
            }
        }
        let listener = UdpSocket::bind(config.bind).map_err(|err| TftpServerError::Bind {
            addr: config.bind,
            err,
        })?;
        let local_addr = listener.local_addr().map_err(TftpServerError::Socket)?;
        listener
            .set_read_timeout(Some(POLL_STEP))
            .map_err(TftpServerError::Socket)?;

        let wake_ip = match local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        info!(%local_addr, source = ?config.source, "TFTP server listening");

        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                state: Mutex::new(ServerState {
                    busy: false,
                    armed: config.sessions,
                    stats: TftpStats::default(),
                }),
                stopped: AtomicBool::new(false),
                wake_addr: SocketAddr::new(wake_ip, local_addr.port()),
            }),
            config,
        })
    }

    /// The address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns a handle to control the server.
    pub fn handle(&self) -> TftpServerHandle {
        TftpServerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Runs the server on a new thread.
    pub fn spawn(self) -> io::Result<(TftpServerHandle, JoinHandle<()>)> {
        let handle = self.handle();
        let thread = std::thread::Builder::new()
            .name("tftp-server".to_owned())
            .spawn(move || self.serve())?;
        Ok((handle, thread))
    }

    /// Serves requests until stopped. Sessions are served one at a time, in arrival order.
    pub fn serve(self) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        while !self.is_stopped() {
            let (len, client) = match self.listener.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err) if is_timeout(&err) => continue,
                Err(err) => {
                    if !self.is_stopped() {
                        warn!(%err, "TFTP listener failed");
                    }
                    break;
                }
            };
            if self.is_stopped() {
                break;
            }
            if len == 0 {
                continue;
            }

            match Packet::parse(&buf[..len]) {
                Ok(Packet::ReadRequest {
                    filename,
                    mode,
                    options,
                }) => self.start_session(client, &filename, &mode, &options),
                Ok(Packet::Error { code, message }) => {
                    trace!(%client, code, %message, "ignoring error packet on listener");
                }
                Ok(packet) => {
                    debug!(%client, %packet, "illegal request");
                    self.reply(
                        &self.listener,
                        client,
                        Packet::error(ErrorCode::IllegalOperation, "only read requests are served"),
                    );
                }
                Err(err) => {
                    debug!(%client, %err, "malformed request");
                    self.reply(
                        &self.listener,
                        client,
                        Packet::error(ErrorCode::IllegalOperation, err.to_string()),
                    );
                }
            }
        }
        debug!("TFTP server stopped");
    }

    // ---
    // Helper methods
    // ---

    fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    fn reply(&self, socket: &UdpSocket, client: SocketAddr, packet: Packet) {
        trace!(%client, %packet, "send");
        if let Err(err) = socket.send_to(&packet.encode(), client) {
            debug!(%client, %err, "TFTP send failed");
        }
    }

    fn start_session(&self, client: SocketAddr, filename: &str, mode: &str, options: &[TftpOption]) {
        debug!(%client, filename, mode, "read request");

        {
            let mut state = lock(&self.shared.state);
            if state.armed == Some(0) {
                state.stats.requests_refused += 1;
                drop(state);
                self.reply(
                    &self.listener,
                    client,
                    Packet::error(ErrorCode::NotDefined, "no transfer is expected"),
                );
                return;
            }
        }

        let path = match resolve_path(&self.config.source, filename) {
            Ok(path) => path,
            Err((code, message)) => {
                self.reply(&self.listener, client, Packet::error(code, message));
                return;
            }
        };
        let image = match std::fs::read(&path) {
            Ok(image) => Bytes::from(image),
            Err(err) => {
                debug!(%path, %err, "cannot read file");
                self.reply(
                    &self.listener,
                    client,
                    Packet::error(ErrorCode::FileNotFound, format!("{filename}: {err}")),
                );
                return;
            }
        };

        // Each session talks from its own port.
        let socket = match UdpSocket::bind(SocketAddr::new(self.local_addr.ip(), 0))
            .and_then(|socket| socket.set_read_timeout(Some(POLL_STEP)).map(|()| socket))
        {
            Ok(socket) => socket,
            Err(err) => {
                warn!(%err, "cannot bind TFTP session socket");
                self.reply(
                    &self.listener,
                    client,
                    Packet::error(ErrorCode::NotDefined, "cannot open session"),
                );
                return;
            }
        };

        {
            let mut state = lock(&self.shared.state);
            state.busy = true;
            state.stats.sessions_started += 1;
            if let Some(armed) = &mut state.armed {
                *armed = armed.saturating_sub(1);
            }
        }

        let negotiated = negotiate(options, image.len() as u64, self.config.timeout);
        let session = Session {
            socket,
            client,
            image,
            block_size: usize::from(negotiated.block_size),
            timeout: negotiated.timeout + TIMEOUT_GUARD,
            resend_limit: self.config.resend_limit,
            shared: &self.shared,
        };
        let completed = session.run(negotiated.oack);

        let mut state = lock(&self.shared.state);
        state.busy = false;
        if completed {
            state.stats.sessions_completed += 1;
            info!(%client, %path, "TFTP transfer complete");
        } else {
            state.stats.sessions_failed += 1;
        }
    }
}

/// Options accepted for a session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Negotiated {
    /// The block size.
    pub block_size: u16,
    /// The acknowledgement timeout.
    pub timeout: Duration,
    /// The options to acknowledge; empty if none were accepted.
    pub oack: Vec<TftpOption>,
}

/// Accepts the supported subset of requested options.
pub fn negotiate(options: &[TftpOption], file_size: u64, default_timeout: Duration) -> Negotiated {
    let mut negotiated = Negotiated {
        block_size: DEFAULT_BLOCK_SIZE,
        timeout: default_timeout,
        oack: Vec::new(),
    };
    for option in options {
        match option.name.as_str() {
            "blksize" => {
                if let Some(size) = option
                    .value
                    .parse::<u16>()
                    .ok()
                    .filter(|size| BLOCK_SIZE_RANGE.contains(size))
                {
                    negotiated.block_size = size;
                    negotiated.oack.push(TftpOption::new("blksize", size.to_string()));
                }
            }
            "timeout" => {
                if let Some(secs) = option
                    .value
                    .parse::<u64>()
                    .ok()
                    .filter(|secs| TIMEOUT_RANGE.contains(secs))
                {
                    negotiated.timeout = Duration::from_secs(secs);
                    negotiated.oack.push(TftpOption::new("timeout", secs.to_string()));
                }
            }
            "tsize" => {
                if file_size != 0 {
                    negotiated
                        .oack
                        .push(TftpOption::new("tsize", file_size.to_string()));
                }
            }
            other => trace!(option = other, "ignoring unsupported option"),
        }
    }
    negotiated
}

/// Maps a requested file name onto a path.
pub fn resolve_path(
    source: &FileSource,
    filename: &str,
) -> Result<Utf8PathBuf, (ErrorCode, String)> {
    match source {
        FileSource::Forced(path) => Ok(path.clone()),
        FileSource::Root(root) => {
            let requested = Utf8Path::new(filename.trim_start_matches('/'));
            let mut path = root.clone();
            for component in requested.components() {
                match component {
                    Utf8Component::Normal(part) => path.push(part),
                    Utf8Component::CurDir => {}
                    Utf8Component::ParentDir | Utf8Component::RootDir | Utf8Component::Prefix(_) => {
                        return Err((
                            ErrorCode::AccessViolation,
                            format!("{filename}: outside of the served directory"),
                        ));
                    }
                }
            }
            if path.is_file() {
                Ok(path)
            } else {
                Err((ErrorCode::FileNotFound, format!("{filename}: file not found")))
            }
        }
    }
}

/// One client's transfer.
struct Session<'a> {
    socket: UdpSocket,
    client: SocketAddr,
    image: Bytes,
    block_size: usize,
    timeout: Duration,
    resend_limit: u32,
    shared: &'a Shared,
}

impl Session<'_> {
    /// Runs the transfer. Returns true if the client acknowledged the last block.
    fn run(self, oack: Vec<TftpOption>) -> bool {
        // Block 0 is the OACK when options were accepted. It is always followed by at least one
        // DATA block.
        let (mut block, mut last, mut last_len, mut finished) = if oack.is_empty() {
            let (data, len) = self.data(1, 0);
            (1u16, data, len, len < self.block_size)
        } else {
            (0u16, Packet::OptionAck { options: oack }.encode(), 0, false)
        };
        let mut last_is_data = block == 1;
        let mut offset = 0usize;
        self.send(&last, last_is_data);

        let mut resends = 0u32;
        let mut waited = Duration::ZERO;
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            if self.shared.stopped.load(Ordering::Acquire) {
                debug!(client = %self.client, "session abandoned: server stopping");
                return false;
            }

            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err) if is_timeout(&err) => {
                    waited += POLL_STEP;
                    if waited < self.timeout {
                        continue;
                    }
                    waited = Duration::ZERO;
                    resends += 1;
                    if resends >= self.resend_limit {
                        return self.give_up();
                    }
                    debug!(client = %self.client, block, resends, "timeout, resending");
                    self.resend(&last, last_is_data);
                    continue;
                }
                Err(err) => {
                    warn!(client = %self.client, %err, "TFTP session socket failed");
                    return false;
                }
            };

            if from != self.client {
                debug!(%from, "packet from unknown transfer ID");
                self.send_to(
                    Packet::error(ErrorCode::UnknownTransferId, "unknown transfer ID"),
                    from,
                );
                continue;
            }

            match Packet::parse(&buf[..len]) {
                Ok(Packet::Ack { block: acked }) if acked == block => {
                    waited = Duration::ZERO;
                    resends = 0;
                    if finished {
                        return true;
                    }
                    offset += last_len;
                    block = block.wrapping_add(1);
                    (last, last_len) = self.data(block, offset);
                    finished = last_len < self.block_size;
                    last_is_data = true;
                    self.send(&last, true);
                }
                Ok(Packet::Ack { block: acked }) => {
                    resends += 1;
                    if resends >= self.resend_limit {
                        return self.give_up();
                    }
                    debug!(client = %self.client, acked, block, resends, "unexpected ACK, resending");
                    self.resend(&last, last_is_data);
                }
                Ok(Packet::Error { code, message }) => {
                    debug!(client = %self.client, code, %message, "client aborted transfer");
                    return false;
                }
                Ok(packet) => {
                    debug!(client = %self.client, %packet, "illegal packet in session");
                    self.send_to(
                        Packet::error(ErrorCode::IllegalOperation, "unexpected packet"),
                        self.client,
                    );
                    return false;
                }
                Err(err) => {
                    debug!(client = %self.client, %err, "malformed packet in session");
                    self.send_to(
                        Packet::error(ErrorCode::IllegalOperation, err.to_string()),
                        self.client,
                    );
                    return false;
                }
            }
        }
    }

    /// Encodes the DATA packet for `block` starting at `offset`, returning it and its payload
    /// length.
    fn data(&self, block: u16, offset: usize) -> (Bytes, usize) {
        let start = offset.min(self.image.len());
        let end = (start + self.block_size).min(self.image.len());
        let payload = self.image.slice(start..end);
        let len = payload.len();
        (
            Packet::Data {
                block,
                data: payload,
            }
            .encode(),
            len,
        )
    }

    fn send(&self, datagram: &Bytes, is_data: bool) {
        if is_data {
            lock(&self.shared.state).stats.blocks_sent += 1;
        }
        if let Err(err) = self.socket.send_to(datagram, self.client) {
            debug!(client = %self.client, %err, "TFTP send failed");
        }
    }

    fn resend(&self, datagram: &Bytes, is_data: bool) {
        if is_data {
            lock(&self.shared.state).stats.resends += 1;
        }
        self.send(datagram, is_data);
    }

    fn send_to(&self, packet: Packet, to: SocketAddr) {
        trace!(%to, %packet, "send");
        if let Err(err) = self.socket.send_to(&packet.encode(), to) {
            debug!(%to, %err, "TFTP send failed");
        }
    }

    fn give_up(&self) -> bool {
        warn!(client = %self.client, limit = self.resend_limit, "TFTP resend limit reached");
        self.send_to(
            Packet::error(ErrorCode::NotDefined, "resend limit reached"),
            self.client,
        );
        false
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
