// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{config::Placeholders, console::ConsoleKind, errors::DirectiveParseError};
use std::fmt;

/// One line of a directive script.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Directive {
    /// Selects the target console.
    Console(ConsoleKind),

    /// Runs a simulator or loader as a child process.
    Execute {
        /// Don't report a non-zero exit as a target error.
        ignore_exit_code: bool,
        /// The program and its arguments.
        command: Vec<String>,
    },

    /// Runs the test under a debugger, scripted with `gdb_script`.
    Gdb {
        /// The debugger and its arguments, without the executable.
        command: Vec<String>,
    },

    /// Serves the executable to a network-booting board.
    Tftp {
        /// Overrides `tftp_port`.
        port: Option<u16>,
    },

    /// Only watches the console.
    Wait,
}

impl Directive {
    /// Parses one script line.
    pub fn parse(line: &str) -> Result<Self, DirectiveParseError> {
        Self::from_words(&split_words(line)?, line)
    }

    fn from_words(words: &[String], line: &str) -> Result<Self, DirectiveParseError> {
        let Some((name, args)) = words.split_first() else {
            return Err(DirectiveParseError::UnknownDirective {
                directive: String::new(),
                line: line.to_owned(),
            });
        };

        match name.as_str() {
            "console" => parse_console(args).map(Self::Console),
            "execute" => {
                let (ignore_exit_code, command) = match args.split_first() {
                    Some((flag, rest)) if flag == "--ignore-exit-code" => (true, rest),
                    _ => (false, args),
                };
                if command.is_empty() {
                    return Err(DirectiveParseError::MissingArgument {
                        directive: "execute",
                        expected: "a command to run",
                    });
                }
                Ok(Self::Execute {
                    ignore_exit_code,
                    command: command.to_vec(),
                })
            }
            "gdb" => {
                if args.is_empty() {
                    return Err(DirectiveParseError::MissingArgument {
                        directive: "gdb",
                        expected: "a debugger command",
                    });
                }
                Ok(Self::Gdb {
                    command: args.to_vec(),
                })
            }
            "tftp" => match args {
                [] => Ok(Self::Tftp { port: None }),
                [port] => port
                    .parse()
                    .map(|port| Self::Tftp { port: Some(port) })
                    .map_err(|_| DirectiveParseError::InvalidArgument {
                        directive: "tftp",
                        argument: port.clone(),
                    }),
                [_, extra, ..] => Err(DirectiveParseError::InvalidArgument {
                    directive: "tftp",
                    argument: extra.clone(),
                }),
            },
            "wait" => match args {
                [] => Ok(Self::Wait),
                [extra, ..] => Err(DirectiveParseError::InvalidArgument {
                    directive: "wait",
                    argument: extra.clone(),
                }),
            },
            other => Err(DirectiveParseError::UnknownDirective {
                directive: other.to_owned(),
                line: line.to_owned(),
            }),
        }
    }

    /// Returns true for the directives that run a test.
    pub fn is_backend(&self) -> bool {
        !matches!(self, Self::Console(_))
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Console(kind) => write!(f, "console {kind}"),
            Self::Execute {
                ignore_exit_code,
                command,
            } => {
                write!(f, "execute ")?;
                if *ignore_exit_code {
                    write!(f, "--ignore-exit-code ")?;
                }
                write!(f, "{}", shell_words::join(command))
            }
            Self::Gdb { command } => write!(f, "gdb {}", shell_words::join(command)),
            Self::Tftp { port: Some(port) } => write!(f, "tftp {port}"),
            Self::Tftp { port: None } => write!(f, "tftp"),
            Self::Wait => write!(f, "wait"),
        }
    }
}

fn split_words(line: &str) -> Result<Vec<String>, DirectiveParseError> {
    shell_words::split(line).map_err(|err| DirectiveParseError::Quoting {
        line: line.to_owned(),
        err,
    })
}

fn parse_console(args: &[String]) -> Result<ConsoleKind, DirectiveParseError> {
    match args {
        [kind] if kind == "stdio" => Ok(ConsoleKind::Stdio),
        [kind, device] if kind == "tty" => Ok(ConsoleKind::Tty(device.into())),
        [kind, address] if kind == "telnet" => {
            if address.rsplit_once(':').is_some_and(|(host, port)| {
                !host.is_empty() && port.parse::<u16>().is_ok()
            }) {
                Ok(ConsoleKind::Telnet(address.clone()))
            } else {
                Err(DirectiveParseError::InvalidArgument {
                    directive: "console",
                    argument: address.clone(),
                })
            }
        }
        [kind] if kind == "tty" || kind == "telnet" => Err(DirectiveParseError::MissingArgument {
            directive: "console",
            expected: "a device or host:port",
        }),
        [] => Err(DirectiveParseError::MissingArgument {
            directive: "console",
            expected: "stdio, tty <device> or telnet <host:port>",
        }),
        [kind, ..] => Err(DirectiveParseError::InvalidArgument {
            directive: "console",
            argument: kind.clone(),
        }),
    }
}

/// A validated directive script: an optional console followed by one backend directive.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirectiveScript {
    lines: Vec<String>,
    console: ConsoleKind,
    backend: Directive,
}

impl DirectiveScript {
    /// Parses and validates script lines.
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> Result<Self, DirectiveParseError> {
        let lines: Vec<String> = lines.iter().map(|line| line.as_ref().to_owned()).collect();
        let directives = lines
            .iter()
            .map(|line| Directive::parse(line))
            .collect::<Result<Vec<_>, _>>()?;
        Self::validate(lines, directives)
    }

    /// Substitutes placeholders in every line and parses the result again.
    ///
    /// Lines are split into words first, so a substituted path containing spaces stays a single
    /// argument.
    pub fn expand(&self, placeholders: &Placeholders<'_>) -> Result<Self, DirectiveParseError> {
        let mut lines = Vec::with_capacity(self.lines.len());
        let mut directives = Vec::with_capacity(self.lines.len());
        for line in &self.lines {
            let words: Vec<String> = split_words(line)?
                .iter()
                .map(|word| placeholders.expand(word))
                .collect();
            directives.push(Directive::from_words(&words, line)?);
            lines.push(shell_words::join(&words));
        }
        Self::validate(lines, directives)
    }

    fn validate(
        lines: Vec<String>,
        directives: Vec<Directive>,
    ) -> Result<Self, DirectiveParseError> {
        let mut console = None;
        let mut backend = None;
        for (line, directive) in lines.iter().zip(directives) {
            match directive {
                Directive::Console(kind) => {
                    if backend.is_some() {
                        return Err(DirectiveParseError::ConsoleAfterBackend {
                            line: line.clone(),
                        });
                    }
                    console = Some(kind);
                }
                directive => {
                    if backend.is_some() {
                        return Err(DirectiveParseError::MultipleBackends {
                            line: line.clone(),
                        });
                    }
                    backend = Some(directive);
                }
            }
        }
        Ok(Self {
            lines,
            console: console.unwrap_or_default(),
            backend: backend.ok_or(DirectiveParseError::NoBackend)?,
        })
    }

    /// The console.
    pub fn console(&self) -> &ConsoleKind {
        &self.console
    }

    /// The backend directive.
    pub fn backend(&self) -> &Directive {
        &self.backend
    }

    /// The script lines, after expansion for an expanded script.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Returns true if the backend is the debugger.
    pub fn has_gdb(&self) -> bool {
        matches!(self.backend, Directive::Gdb { .. })
    }
}
