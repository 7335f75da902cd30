// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by rtems-tester.

use camino::Utf8PathBuf;
use std::{io, net::SocketAddr};
use thiserror::Error;

/// An error that occurred while reading a tester configuration file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigReadError {
    /// The configuration file could not be read.
    #[error("failed to read tester config at `{path}`")]
    Read {
        /// The path that was read.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: io::Error,
    },

    /// The configuration file is not valid TOML.
    #[error("failed to parse tester config at `{path}`")]
    Toml {
        /// The path that was parsed.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: toml::de::Error,
    },

    /// A value in the configuration file has a type which can't be used as a setting.
    #[error("in `{path}`, key `{key}` has unsupported type {kind}")]
    UnsupportedValue {
        /// The path of the configuration file.
        path: Utf8PathBuf,

        /// The key with the unsupported value.
        key: String,

        /// The TOML type of the value.
        kind: &'static str,
    },

    /// The requested board support package has no section in the configuration.
    #[error("BSP `{bsp}` not found (known BSPs: {})", .known.join(", "))]
    BspNotFound {
        /// The BSP that was requested.
        bsp: String,

        /// The BSPs with a section in the configuration.
        known: Vec<String>,
    },
}

/// An error that occurred while turning the resolved configuration into typed settings.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigValueError {
    /// A mandatory key is not present.
    #[error("mandatory key `{key}` is not set")]
    MissingKey {
        /// The missing key.
        key: String,
    },

    /// A value that should be a number isn't one.
    #[error("key `{key}`: `{value}` is not a valid number")]
    InvalidNumber {
        /// The key.
        key: String,

        /// The value that failed to parse.
        value: String,

        /// The underlying error.
        #[source]
        err: std::num::ParseIntError,
    },

    /// A value that should be a boolean isn't one.
    #[error("key `{key}`: `{value}` is not a valid boolean (expected true/false, yes/no or 1/0)")]
    InvalidBool {
        /// The key.
        key: String,

        /// The value that failed to parse.
        value: String,
    },

    /// A value that should be one of a fixed set of words isn't one.
    #[error("key `{key}`: unrecognized value `{value}` (known values: {})", .known.join(", "))]
    InvalidChoice {
        /// The key.
        key: String,

        /// The value that was found.
        value: String,

        /// The values that are accepted.
        known: &'static [&'static str],
    },

    /// A regular expression failed to compile.
    #[error("key `{key}`: invalid regular expression")]
    InvalidRegex {
        /// The key.
        key: String,

        /// The underlying error.
        #[source]
        err: regex::Error,
    },

    /// The directive script is invalid.
    #[error("invalid directive script")]
    Directive(#[from] DirectiveParseError),
}

/// An error that occurred while parsing a directive script line.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DirectiveParseError {
    /// The directive is not known.
    #[error("unknown directive `{directive}` in `{line}`")]
    UnknownDirective {
        /// The directive name.
        directive: String,

        /// The full line.
        line: String,
    },

    /// The directive needs an argument which is missing.
    #[error("directive `{directive}` requires {expected}")]
    MissingArgument {
        /// The directive name.
        directive: &'static str,

        /// A description of what is expected.
        expected: &'static str,
    },

    /// A directive argument is malformed.
    #[error("directive `{directive}`: invalid argument `{argument}`")]
    InvalidArgument {
        /// The directive name.
        directive: &'static str,

        /// The argument.
        argument: String,
    },

    /// Shell-style quoting in the line could not be parsed.
    #[error("could not split `{line}` into words")]
    Quoting {
        /// The full line.
        line: String,

        /// The underlying error.
        #[source]
        err: shell_words::ParseError,
    },

    /// More than one backend directive was found.
    #[error("script has more than one of execute, gdb, tftp or wait (second one: `{line}`)")]
    MultipleBackends {
        /// The second backend directive.
        line: String,
    },

    /// A console directive was found after the backend directive.
    #[error("console directive `{line}` must come before the backend directive")]
    ConsoleAfterBackend {
        /// The console line.
        line: String,
    },

    /// No backend directive was found.
    #[error("script has none of execute, gdb, tftp or wait")]
    NoBackend,
}

/// An error that occurred while opening a target console.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConsoleOpenError {
    /// The serial device could not be opened.
    #[error("failed to open serial console `{device}`")]
    Tty {
        /// The device path.
        device: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: io::Error,
    },

    /// The telnet console could not be connected.
    #[error("failed to connect to telnet console `{address}`")]
    Telnet {
        /// The address connected to.
        address: String,

        /// The underlying error.
        #[source]
        err: io::Error,
    },
}

/// An error that occurred while opening a backend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendOpenError {
    /// The command line is empty.
    #[error("no command to run")]
    EmptyCommand,

    /// The child process could not be started.
    #[error("failed to start `{command}`")]
    Spawn {
        /// The command that failed to start.
        command: String,

        /// The underlying error.
        #[source]
        err: io::Error,
    },

    /// A pipe to the child process was not available.
    #[error("`{command}` started without a {stream} pipe")]
    MissingPipe {
        /// The command.
        command: String,

        /// The name of the missing stream.
        stream: &'static str,
    },

    /// A worker thread could not be started.
    #[error("failed to start {name} thread")]
    Thread {
        /// The thread name.
        name: String,

        /// The underlying error.
        #[source]
        err: io::Error,
    },

    /// The TFTP server could not be started.
    #[error("TFTP server error")]
    Tftp(#[from] TftpServerError),
}

/// An error that prevented a test from running to completion.
///
/// These end the test with whatever outcome its output supports; the run goes on.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunError {
    /// The directive script didn't parse after placeholders were substituted.
    #[error("invalid directive script for this test")]
    Directive(#[from] DirectiveParseError),

    /// The console could not be opened.
    #[error("failed to open console")]
    Console(#[from] ConsoleOpenError),

    /// The backend could not be opened.
    #[error("failed to open {backend} backend")]
    Backend {
        /// The backend name.
        backend: &'static str,

        /// The underlying error.
        #[source]
        err: BackendOpenError,
    },
}

/// An error that occurred in the TFTP server outside of a protocol exchange.
///
/// Protocol errors are answered on the wire and never surface as this type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TftpServerError {
    /// The listening socket could not be bound.
    #[error("failed to bind TFTP server to {addr}")]
    Bind {
        /// The address.
        addr: SocketAddr,

        /// The underlying error.
        #[source]
        err: io::Error,
    },

    /// A socket operation failed.
    #[error("TFTP socket error")]
    Socket(#[source] io::Error),

    /// The file the server was told to always serve does not exist.
    #[error("TFTP image `{path}` does not exist")]
    ImageNotFound {
        /// The path.
        path: Utf8PathBuf,
    },
}

/// An error that occurred while parsing a TFTP packet.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PacketParseError {
    /// The packet is shorter than its fixed header.
    #[error("packet too short ({len} bytes)")]
    TooShort {
        /// The length of the packet.
        len: usize,
    },

    /// The opcode is not a TFTP opcode.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),

    /// A string field is missing its terminating NUL.
    #[error("{field} is not NUL terminated")]
    Unterminated {
        /// The field name.
        field: &'static str,
    },

    /// A string field is not valid ASCII/UTF-8.
    #[error("{field} is not valid text")]
    InvalidText {
        /// The field name.
        field: &'static str,
    },

    /// An option name has no value.
    #[error("option `{name}` has no value")]
    MissingOptionValue {
        /// The option name.
        name: String,
    },
}

/// An error that occurred while parsing a GDB machine-interface record.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum MiParseError {
    /// The line is empty.
    #[error("empty MI record")]
    Empty,

    /// The line does not start with an MI record prefix.
    #[error("not an MI record: `{line}`")]
    NotARecord {
        /// The line.
        line: String,
    },

    /// The record ended in the middle of a value.
    #[error("unexpected end of MI record at offset {offset}")]
    UnexpectedEnd {
        /// The byte offset.
        offset: usize,
    },

    /// An unexpected character was found.
    #[error("unexpected `{found}` at offset {offset} in MI record")]
    Unexpected {
        /// The character.
        found: char,

        /// The byte offset.
        offset: usize,
    },
}

/// An error that occurred while finding test executables.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestDiscoveryError {
    /// A path passed in does not exist.
    #[error("test path `{path}` does not exist")]
    NotFound {
        /// The path.
        path: Utf8PathBuf,
    },

    /// A directory could not be walked.
    #[error("failed to search `{path}` for test executables")]
    Walk {
        /// The directory.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: walkdir::Error,
    },

    /// A path found while walking is not UTF-8.
    #[error("test executable path `{path}` is not valid UTF-8")]
    NonUtf8 {
        /// A lossy rendering of the path.
        path: String,
    },
}

/// An error that occurred while setting up the interrupt handler.
#[derive(Debug, Error)]
#[error("error setting up Ctrl-C handler")]
pub struct SignalHandlerSetupError(#[from] ctrlc::Error);

/// An error that occurred while opening the run log.
#[derive(Debug, Error)]
#[error("failed to create log file `{path}`")]
pub struct RunLogError {
    pub(crate) path: Utf8PathBuf,
    #[source]
    pub(crate) err: io::Error,
}

/// An error that occurs while parsing a [`ReportMode`](crate::report::ReportMode) value from a
/// string.
#[derive(Clone, Debug, Error)]
#[error(
    "unrecognized value for report-mode: {input}\n(known values: {})",
    crate::report::ReportMode::variants().join(", "),
)]
pub struct ReportModeParseError {
    input: String,
}

impl ReportModeParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// Displays an error followed by its chain of sources, one per line.
pub struct DisplayErrorChain<E> {
    error: E,
}

impl<E: std::error::Error> DisplayErrorChain<E> {
    /// Wraps an error.
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E: std::error::Error> std::fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)?;
        let mut source = self.error.source();
        if source.is_some() {
            write!(f, "\n  caused by:")?;
        }
        while let Some(err) = source {
            write!(f, "\n  - {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_chain() {
        let err = BackendOpenError::Spawn {
            command: "sparc-rtems6-sis hello.exe".to_owned(),
            err: io::Error::new(io::ErrorKind::NotFound, "not found"),
        };
        assert_eq!(
            DisplayErrorChain::new(&err).to_string(),
            "failed to start `sparc-rtems6-sis hello.exe`\n  caused by:\n  - not found"
        );
        assert_eq!(
            DisplayErrorChain::new(BackendOpenError::EmptyCommand).to_string(),
            "no command to run"
        );
    }

    #[test]
    fn report_mode_parse_error_lists_variants() {
        let err = ReportModeParseError::new("some");
        assert_eq!(
            err.to_string(),
            "unrecognized value for report-mode: some\n(known values: all, failures, none)"
        );
    }
}
