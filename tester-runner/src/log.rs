// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The run log.
//!
//! A [`RunLog`] is created once at startup and handed to everything that reports on the run. It
//! writes notices to the terminal and the log file, and captured test output to the log file only
//! (or also the terminal, when verbose). Diagnostics about the tester itself go through `tracing`
//! instead.

use crate::{errors::RunLogError, helpers::lock};
use camino::Utf8Path;
use owo_colors::Style;
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    sync::Mutex,
};
use tracing::warn;

/// Styles used for terminal output.
#[derive(Clone, Debug, Default)]
pub struct Styles {
    /// Whether any style is set.
    pub is_colorized: bool,
    /// Counts.
    pub count: Style,
    /// Passing outcomes.
    pub pass: Style,
    /// Failing outcomes.
    pub fail: Style,
    /// Outcomes that are neither, such as timeouts and benchmarks.
    pub skip: Style,
    /// Test names.
    pub name: Style,
}

impl Styles {
    /// Sets the terminal styles.
    pub fn colorize(&mut self) {
        self.is_colorized = true;
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.skip = Style::new().yellow().bold();
        self.name = Style::new().blue().bold();
    }
}

enum Destination {
    Stdout(io::Stdout),
    File(BufWriter<File>),
    Memory(Vec<u8>),
}

impl Destination {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        match self {
            Self::Stdout(stdout) => writeln!(stdout.lock(), "{line}"),
            Self::File(file) => writeln!(file, "{line}"),
            Self::Memory(buf) => writeln!(buf, "{line}"),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stdout(stdout) => stdout.flush(),
            Self::File(file) => file.flush(),
            Self::Memory(_) => Ok(()),
        }
    }

    fn contents(&self) -> String {
        match self {
            Self::Memory(buf) => String::from_utf8_lossy(buf).into_owned(),
            Self::Stdout(_) | Self::File(_) => String::new(),
        }
    }
}

struct Inner {
    terminal: Destination,
    file: Option<Destination>,
    write_failed: bool,
}

impl Inner {
    fn write(&mut self, terminal: Option<&str>, file: &str) {
        let mut result = Ok(());
        if let Some(line) = terminal {
            result = self.terminal.write_line(line);
        }
        if let Some(dest) = &mut self.file {
            result = result.and(dest.write_line(file));
        }
        if let Err(err) = result {
            if !self.write_failed {
                self.write_failed = true;
                warn!(%err, "failed to write to the run log, further errors are ignored");
            }
        }
    }
}

/// The log for a test run.
pub struct RunLog {
    inner: Mutex<Inner>,
    verbose: bool,
    styles: Styles,
}

impl RunLog {
    /// Creates a log writing to standard output and, if given, to a file at `path`.
    pub fn new(path: Option<&Utf8Path>, verbose: bool) -> Result<Self, RunLogError> {
        let file = match path {
            Some(path) => {
                let file = File::create(path).map_err(|err| RunLogError {
                    path: path.to_owned(),
                    err,
                })?;
                Some(Destination::File(BufWriter::new(file)))
            }
            None => None,
        };
        Ok(Self::with_destinations(
            Destination::Stdout(io::stdout()),
            file,
            verbose,
        ))
    }

    /// Creates a log that keeps everything in memory.
    ///
    /// [`terminal_contents`](Self::terminal_contents) and [`file_contents`](Self::file_contents)
    /// return what was written.
    pub fn buffer(verbose: bool) -> Self {
        Self::with_destinations(
            Destination::Memory(Vec::new()),
            Some(Destination::Memory(Vec::new())),
            verbose,
        )
    }

    fn with_destinations(terminal: Destination, file: Option<Destination>, verbose: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                terminal,
                file,
                write_failed: false,
            }),
            verbose,
            styles: Styles::default(),
        }
    }

    /// Enables colors on the terminal. The log file is never colored.
    pub fn colorize(&mut self) {
        self.styles.colorize();
    }

    /// Returns true if captured output also goes to the terminal.
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Writes a notice to the terminal and the log file.
    pub fn notice(&self, line: &str) {
        lock(&self.inner).write(Some(line), line);
    }

    /// Writes a notice built from styles: the terminal gets the styled rendering, the log file the
    /// plain one.
    pub fn notice_with(&self, render: impl Fn(&Styles) -> String) {
        let plain = render(&Styles::default());
        if self.styles.is_colorized {
            let styled = render(&self.styles);
            lock(&self.inner).write(Some(&styled), &plain);
        } else {
            lock(&self.inner).write(Some(&plain), &plain);
        }
    }

    /// Writes captured output: to the log file, and to the terminal if verbose.
    pub fn output(&self, line: &str) {
        let terminal = self.verbose.then_some(line);
        lock(&self.inner).write(terminal, line);
    }

    /// Writes a block of captured output without interleaving with other threads.
    pub fn output_block<'a>(&self, lines: impl IntoIterator<Item = &'a str>) {
        let mut inner = lock(&self.inner);
        for line in lines {
            let terminal = self.verbose.then_some(line);
            inner.write(terminal, line);
        }
    }

    /// Flushes both destinations.
    pub fn flush(&self) -> io::Result<()> {
        let mut inner = lock(&self.inner);
        inner.terminal.flush()?;
        if let Some(file) = &mut inner.file {
            file.flush()?;
        }
        Ok(())
    }

    /// What was written to the terminal, for in-memory logs.
    pub fn terminal_contents(&self) -> String {
        lock(&self.inner).terminal.contents()
    }

    /// What was written to the log file, for in-memory logs.
    pub fn file_contents(&self) -> String {
        lock(&self.inner)
            .file
            .as_ref()
            .map(Destination::contents)
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for RunLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLog")
            .field("verbose", &self.verbose)
            .field("colorized", &self.styles.is_colorized)
            .finish_non_exhaustive()
    }
}
