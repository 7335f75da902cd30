// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Captured output for a test.
//!
//! Backends and consoles read bytes from processes and sockets, reassemble them into lines with a
//! [`LineAssembler`], and hand them to an [`OutputSink`]. The sink for a real test is the
//! [`TestSession`](crate::session::TestSession), which keeps the lines in a [`CaptureBuffer`] and
//! feeds target lines to the classifier.

use crate::monitor::MonitorEvent;
use std::{
    fmt,
    io::{self, Read},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::trace;

/// Where a captured line came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CaptureSource {
    /// Output from the target: the test firmware's console. Classified, and counted as activity
    /// by the monitor loop.
    Target,

    /// Output from a host tool such as the debugger or a simulator whose output isn't the target
    /// console.
    Console,

    /// A line synthesized by the tester itself.
    Notice,
}

impl CaptureSource {
    /// The prefix used when the line is written to the log.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Target => "]",
            Self::Console => ">",
            Self::Notice => "=>",
        }
    }
}

/// A single captured line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CapturedLine {
    /// Where the line came from.
    pub source: CaptureSource,

    /// The line, without its terminator.
    pub line: String,
}

impl fmt::Display for CapturedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.source.prefix(), self.line)
    }
}

/// The ordered output captured for one test.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CaptureBuffer {
    lines: Vec<CapturedLine>,
}

impl CaptureBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a line.
    pub fn push(&mut self, source: CaptureSource, line: impl Into<String>) {
        self.lines.push(CapturedLine {
            source,
            line: line.into(),
        });
    }

    /// Iterates over the captured lines in arrival order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &CapturedLine> + '_ {
        self.lines.iter()
    }

    /// Returns the number of captured lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Returns true if nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Receives captured output for a test.
///
/// Implementations are called from reader threads and must be cheap: lock, append, unlock.
pub trait OutputSink: Send + Sync {
    /// Records one complete line.
    fn capture_line(&self, source: CaptureSource, line: &str);

    /// Records that `bytes` bytes of target output arrived, complete line or not.
    fn note_activity(&self, bytes: usize);

    /// The total number of target bytes seen so far. Polled by the monitor loop.
    fn output_length(&self) -> u64;

    /// Called when the monitor loop fires, before the backend stops the target.
    fn monitor_fired(&self, event: MonitorEvent);
}

/// A shareable counter of output bytes.
#[derive(Clone, Debug, Default)]
pub struct OutputLength {
    inner: Arc<AtomicU64>,
}

impl OutputLength {
    /// Creates a counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `bytes` to the counter.
    pub fn add(&self, bytes: usize) {
        self.inner.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Returns the current count.
    pub fn get(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

/// Reassembles lines from a byte stream.
///
/// Lines are split on `\n`; a trailing `\r` is dropped. Invalid UTF-8 is replaced.
#[derive(Debug, Default)]
pub struct LineAssembler {
    partial: Vec<u8>,
}

impl LineAssembler {
    /// Creates an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of bytes, calling `f` for each line completed by it.
    pub fn push(&mut self, data: &[u8], mut f: impl FnMut(&str)) {
        let mut rest = data;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];
            self.emit(&mut f);
        }
        self.partial.extend_from_slice(rest);
    }

    /// Flushes a trailing partial line, if any.
    pub fn finish(&mut self, mut f: impl FnMut(&str)) {
        if !self.partial.is_empty() {
            self.emit(&mut f);
        }
    }

    fn emit(&mut self, f: &mut impl FnMut(&str)) {
        if self.partial.last() == Some(&b'\r') {
            self.partial.pop();
        }
        let line = String::from_utf8_lossy(&self.partial);
        f(&line);
        self.partial.clear();
    }
}

/// Reads `reader` to the end, forwarding its lines to `sink`.
///
/// Target bytes are reported as activity as soon as they are read. Returns when the stream closes
/// or fails; a read error ends the stream like EOF does.
pub fn pump_lines(mut reader: impl Read, source: CaptureSource, sink: &dyn OutputSink) {
    let mut assembler = LineAssembler::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if source == CaptureSource::Target {
                    sink.note_activity(n);
                }
                assembler.push(&buf[..n], |line| sink.capture_line(source, line));
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                trace!(?source, %err, "output stream closed with error");
                break;
            }
        }
    }
    assembler.finish(|line| sink.capture_line(source, line));
}
