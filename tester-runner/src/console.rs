// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Target consoles.
//!
//! By default the backend's own process output is the target console. A board on a serial line
//! or a terminal server has a separate console instead: a reader thread feeds its lines into the
//! capture as target output while the backend runs.

use crate::{
    capture::{CaptureSource, OutputSink, pump_lines},
    errors::ConsoleOpenError,
};
use camino::{Utf8Path, Utf8PathBuf};
use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, Read},
    net::{Shutdown, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};
use tracing::{debug, warn};

/// How often a serial console checks for a close request when no data arrives.
const TTY_POLL: Duration = Duration::from_millis(50);

/// Where the target console is.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ConsoleKind {
    /// The backend's process output.
    #[default]
    Stdio,

    /// A serial device.
    Tty(Utf8PathBuf),

    /// A telnet server, as `host:port`.
    Telnet(String),
}

impl ConsoleKind {
    /// Returns true if the backend's process output is the console.
    pub fn is_stdio(&self) -> bool {
        matches!(self, Self::Stdio)
    }

    /// Opens the console, starting its reader thread. Returns `None` for [`ConsoleKind::Stdio`].
    pub fn open(&self, sink: Arc<dyn OutputSink>) -> Result<Option<Console>, ConsoleOpenError> {
        match self {
            Self::Stdio => Ok(None),
            Self::Tty(device) => {
                let file = open_tty(device).map_err(|err| ConsoleOpenError::Tty {
                    device: device.clone(),
                    err,
                })?;
                let stop = Arc::new(AtomicBool::new(false));
                let reader = PollingReader {
                    inner: file,
                    stop: stop.clone(),
                };
                let thread = spawn_reader("console-tty", reader, sink).map_err(|err| {
                    ConsoleOpenError::Tty {
                        device: device.clone(),
                        err,
                    }
                })?;
                debug!(%device, "serial console open");
                Ok(Some(Console {
                    kind: self.clone(),
                    stop,
                    stream: None,
                    thread: Some(thread),
                }))
            }
            Self::Telnet(address) => {
                let telnet_err = |err| ConsoleOpenError::Telnet {
                    address: address.clone(),
                    err,
                };
                let stream = TcpStream::connect(address.as_str()).map_err(telnet_err)?;
                let reader = TelnetReader::new(stream.try_clone().map_err(telnet_err)?);
                let thread = spawn_reader("console-telnet", reader, sink).map_err(telnet_err)?;
                debug!(%address, "telnet console open");
                Ok(Some(Console {
                    kind: self.clone(),
                    stop: Arc::new(AtomicBool::new(false)),
                    stream: Some(stream),
                    thread: Some(thread),
                }))
            }
        }
    }
}

impl fmt::Display for ConsoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Tty(device) => write!(f, "tty {device}"),
            Self::Telnet(address) => write!(f, "telnet {address}"),
        }
    }
}

/// An open console. Closed on drop.
pub struct Console {
    kind: ConsoleKind,
    stop: Arc<AtomicBool>,
    stream: Option<TcpStream>,
    thread: Option<JoinHandle<()>>,
}

impl Console {
    /// Stops the reader thread and waits for it, so all console output is captured.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(console = %self.kind, "console reader panicked");
            }
        }
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

fn spawn_reader(
    name: &str,
    reader: impl Read + Send + 'static,
    sink: Arc<dyn OutputSink>,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || pump_lines(reader, CaptureSource::Target, &*sink))
}

#[cfg(unix)]
fn open_tty(device: &Utf8Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
        .open(device)
}

#[cfg(not(unix))]
fn open_tty(device: &Utf8Path) -> io::Result<File> {
    OpenOptions::new().read(true).open(device)
}

/// Reads a non-blocking file, sleeping while no data is ready, until asked to stop.
struct PollingReader<R> {
    inner: R,
    stop: Arc<AtomicBool>,
}

impl<R: Read> Read for PollingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.stop.load(Ordering::Acquire) {
                return Ok(0);
            }
            match self.inner.read(buf) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(TTY_POLL);
                }
                other => return other,
            }
        }
    }
}

const IAC: u8 = 255;
const SB: u8 = 250;
const SE: u8 = 240;
const WILL: u8 = 251;
const DONT: u8 = 254;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum TelnetState {
    #[default]
    Data,
    Iac,
    Option,
    Subnegotiation,
    SubnegotiationIac,
}

/// Strips telnet commands and option negotiation from a byte stream.
///
/// Negotiation requests are not answered; terminal servers fall back to plain data.
#[derive(Debug, Default)]
pub struct TelnetFilter {
    state: TelnetState,
}

impl TelnetFilter {
    /// Creates a filter in the data state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters `data` in place, returning the number of data bytes kept at the front.
    pub fn filter(&mut self, data: &mut [u8]) -> usize {
        let mut kept = 0;
        for idx in 0..data.len() {
            let byte = data[idx];
            self.state = match (self.state, byte) {
                (TelnetState::Data, IAC) => TelnetState::Iac,
                (TelnetState::Data, _) => {
                    data[kept] = byte;
                    kept += 1;
                    TelnetState::Data
                }
                (TelnetState::Iac, IAC) => {
                    // Escaped 255.
                    data[kept] = byte;
                    kept += 1;
                    TelnetState::Data
                }
                (TelnetState::Iac, SB) => TelnetState::Subnegotiation,
                (TelnetState::Iac, WILL..=DONT) => TelnetState::Option,
                (TelnetState::Iac, _) => TelnetState::Data,
                (TelnetState::Option, _) => TelnetState::Data,
                (TelnetState::Subnegotiation, IAC) => TelnetState::SubnegotiationIac,
                (TelnetState::Subnegotiation, _) => TelnetState::Subnegotiation,
                (TelnetState::SubnegotiationIac, SE) => TelnetState::Data,
                (TelnetState::SubnegotiationIac, _) => TelnetState::Subnegotiation,
            };
        }
        kept
    }
}

struct TelnetReader {
    stream: TcpStream,
    filter: TelnetFilter,
}

impl TelnetReader {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            filter: TelnetFilter::new(),
        }
    }
}

impl Read for TelnetReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.stream.read(buf)?;
            if n == 0 {
                return Ok(0);
            }
            let kept = self.filter.filter(&mut buf[..n]);
            // A chunk of pure negotiation isn't end of stream.
            if kept > 0 {
                return Ok(kept);
            }
        }
    }
}
