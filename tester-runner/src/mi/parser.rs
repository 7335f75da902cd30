// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parses GDB/MI output records.
//!
//! The grammar is the one in the GDB manual's "GDB/MI Output Syntax" section:
//!
//! ```text
//! output    ::= ( out-of-band-record )* [ result-record ] "(gdb)"
//! result    ::= variable "=" value
//! value     ::= const | tuple | list
//! tuple     ::= "{}" | "{" result ( "," result )* "}"
//! list      ::= "[]" | "[" value ( "," value )* "]" | "[" result ( "," result )* "]"
//! ```

use crate::errors::MiParseError;
use indexmap::IndexMap;

/// The prompt GDB prints when it is ready for a command.
pub const PROMPT: &str = "(gdb)";

/// A value in a result.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MiValue {
    /// A C string.
    Const(String),

    /// Named values.
    Tuple(Vec<(String, MiValue)>),

    /// Unnamed values. Lists of results are stored as single-entry tuples.
    List(Vec<MiValue>),
}

impl MiValue {
    /// Returns the string if this is a constant.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Const(s) => Some(s),
            _ => None,
        }
    }

    /// Looks up a field if this is a tuple.
    pub fn get(&self, name: &str) -> Option<&MiValue> {
        match self {
            Self::Tuple(results) => lookup(results, name),
            _ => None,
        }
    }

    /// Collects the constant fields of a tuple.
    pub fn const_fields(&self) -> IndexMap<String, String> {
        match self {
            Self::Tuple(results) => results
                .iter()
                .filter_map(|(name, value)| Some((name.clone(), value.as_str()?.to_owned())))
                .collect(),
            _ => IndexMap::new(),
        }
    }
}

/// The class of a result record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResultClass {
    /// `^done`
    Done,
    /// `^running`
    Running,
    /// `^connected`
    Connected,
    /// `^error`
    Error,
    /// `^exit`
    Exit,
    /// Anything else.
    Other(String),
}

impl ResultClass {
    fn parse(class: &str) -> Self {
        match class {
            "done" => Self::Done,
            "running" => Self::Running,
            "connected" => Self::Connected,
            "error" => Self::Error,
            "exit" => Self::Exit,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// The kind of an asynchronous record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AsyncKind {
    /// `*`: the target changed state.
    Exec,
    /// `+`: progress of a slow operation.
    Status,
    /// `=`: supplementary information, such as breakpoint changes.
    Notify,
}

/// The kind of a stream record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamKind {
    /// `~`: output for the console.
    Console,
    /// `@`: output from the target program.
    Target,
    /// `&`: GDB's internal log.
    Log,
}

/// One line of GDB/MI output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MiRecord {
    /// The prompt.
    Prompt,

    /// The result of a command.
    Result {
        /// The command token, if the command had one.
        token: Option<u64>,
        /// The result class.
        class: ResultClass,
        /// Results.
        results: Vec<(String, MiValue)>,
    },

    /// An asynchronous notification.
    Async {
        /// The command token, if any.
        token: Option<u64>,
        /// The kind of notification.
        kind: AsyncKind,
        /// The notification class, such as `stopped` or `breakpoint-created`.
        class: String,
        /// Results.
        results: Vec<(String, MiValue)>,
    },

    /// Text output.
    Stream {
        /// Where the text is destined.
        kind: StreamKind,
        /// The unescaped text.
        text: String,
    },
}

impl MiRecord {
    /// Looks up a result by name in result and async records.
    pub fn get(&self, name: &str) -> Option<&MiValue> {
        match self {
            Self::Result { results, .. } | Self::Async { results, .. } => lookup(results, name),
            Self::Prompt | Self::Stream { .. } => None,
        }
    }
}

fn lookup<'a>(results: &'a [(String, MiValue)], name: &str) -> Option<&'a MiValue> {
    results
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value)
}

/// Parses one line of GDB/MI output.
pub fn parse_line(line: &str) -> Result<MiRecord, MiParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim_end().is_empty() {
        return Err(MiParseError::Empty);
    }
    if line.trim_end() == PROMPT {
        return Ok(MiRecord::Prompt);
    }

    let mut parser = Parser::new(line);
    let token = parser.token();
    let Some(prefix) = parser.bump() else {
        return Err(MiParseError::NotARecord {
            line: line.to_owned(),
        });
    };

    match prefix {
        '^' => {
            let class = parser.identifier();
            let results = parser.trailing_results()?;
            Ok(MiRecord::Result {
                token,
                class: ResultClass::parse(&class),
                results,
            })
        }
        '*' | '+' | '=' => {
            let kind = match prefix {
                '*' => AsyncKind::Exec,
                '+' => AsyncKind::Status,
                _ => AsyncKind::Notify,
            };
            let class = parser.identifier();
            let results = parser.trailing_results()?;
            Ok(MiRecord::Async {
                token,
                kind,
                class,
                results,
            })
        }
        '~' | '@' | '&' if token.is_none() => {
            let kind = match prefix {
                '~' => StreamKind::Console,
                '@' => StreamKind::Target,
                _ => StreamKind::Log,
            };
            let text = parser.c_string()?;
            parser.end()?;
            Ok(MiRecord::Stream { kind, text })
        }
        _ => Err(MiParseError::NotARecord {
            line: line.to_owned(),
        }),
    }
}

struct Parser<'a> {
    input: &'a str,
    offset: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, offset: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.offset..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.offset += c.len_utf8();
        Some(c)
    }

    fn expect(&mut self, expected: char) -> Result<(), MiParseError> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(found) => Err(MiParseError::Unexpected {
                found,
                offset: self.offset - found.len_utf8(),
            }),
            None => Err(MiParseError::UnexpectedEnd {
                offset: self.offset,
            }),
        }
    }

    fn end(&mut self) -> Result<(), MiParseError> {
        // Trailing whitespace is tolerated.
        let rest = &self.input[self.offset..];
        match rest.trim_end().chars().next() {
            None => Ok(()),
            Some(found) => Err(MiParseError::Unexpected {
                found,
                offset: self.offset,
            }),
        }
    }

    fn token(&mut self) -> Option<u64> {
        let digits = self.input[self.offset..]
            .bytes()
            .take_while(u8::is_ascii_digit)
            .count();
        if digits == 0 {
            return None;
        }
        let token = self.input[self.offset..self.offset + digits].parse().ok();
        self.offset += digits;
        token
    }

    fn identifier(&mut self) -> String {
        let start = self.offset;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                self.offset += 1;
            } else {
                break;
            }
        }
        self.input[start..self.offset].to_owned()
    }

    fn trailing_results(&mut self) -> Result<Vec<(String, MiValue)>, MiParseError> {
        let mut results = Vec::new();
        while self.peek() == Some(',') {
            self.offset += 1;
            results.push(self.result()?);
        }
        self.end()?;
        Ok(results)
    }

    fn result(&mut self) -> Result<(String, MiValue), MiParseError> {
        let name = self.identifier();
        if name.is_empty() {
            return Err(self.unexpected());
        }
        self.expect('=')?;
        Ok((name, self.value()?))
    }

    fn value(&mut self) -> Result<MiValue, MiParseError> {
        match self.peek() {
            Some('"') => Ok(MiValue::Const(self.c_string()?)),
            Some('{') => {
                self.offset += 1;
                let mut results = Vec::new();
                if self.peek() == Some('}') {
                    self.offset += 1;
                    return Ok(MiValue::Tuple(results));
                }
                loop {
                    results.push(self.result()?);
                    match self.bump() {
                        Some(',') => continue,
                        Some('}') => return Ok(MiValue::Tuple(results)),
                        Some(found) => {
                            return Err(MiParseError::Unexpected {
                                found,
                                offset: self.offset - found.len_utf8(),
                            });
                        }
                        None => {
                            return Err(MiParseError::UnexpectedEnd {
                                offset: self.offset,
                            });
                        }
                    }
                }
            }
            Some('[') => {
                self.offset += 1;
                let mut values = Vec::new();
                if self.peek() == Some(']') {
                    self.offset += 1;
                    return Ok(MiValue::List(values));
                }
                loop {
                    let value = match self.peek() {
                        Some('"' | '{' | '[') => self.value()?,
                        _ => {
                            let (name, value) = self.result()?;
                            MiValue::Tuple(vec![(name, value)])
                        }
                    };
                    values.push(value);
                    match self.bump() {
                        Some(',') => continue,
                        Some(']') => return Ok(MiValue::List(values)),
                        Some(found) => {
                            return Err(MiParseError::Unexpected {
                                found,
                                offset: self.offset - found.len_utf8(),
                            });
                        }
                        None => {
                            return Err(MiParseError::UnexpectedEnd {
                                offset: self.offset,
                            });
                        }
                    }
                }
            }
            Some(_) => Err(self.unexpected()),
            None => Err(MiParseError::UnexpectedEnd {
                offset: self.offset,
            }),
        }
    }

    fn c_string(&mut self) -> Result<String, MiParseError> {
        self.expect('"')?;
        let mut bytes = Vec::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(MiParseError::UnexpectedEnd {
                    offset: self.offset,
                });
            };
            match c {
                '"' => break,
                '\\' => {
                    let Some(escaped) = self.bump() else {
                        return Err(MiParseError::UnexpectedEnd {
                            offset: self.offset,
                        });
                    };
                    match escaped {
                        'n' => bytes.push(b'\n'),
                        't' => bytes.push(b'\t'),
                        'r' => bytes.push(b'\r'),
                        'e' => bytes.push(0x1b),
                        'a' => bytes.push(0x07),
                        'b' => bytes.push(0x08),
                        'f' => bytes.push(0x0c),
                        'v' => bytes.push(0x0b),
                        '0'..='7' => {
                            // Up to three octal digits.
                            let mut value = escaped.to_digit(8).unwrap_or(0);
                            for _ in 0..2 {
                                match self.peek().and_then(|c| c.to_digit(8)) {
                                    Some(digit) => {
                                        value = value * 8 + digit;
                                        self.offset += 1;
                                    }
                                    None => break,
                                }
                            }
                            bytes.push((value & 0xff) as u8);
                        }
                        other => {
                            let mut buf = [0u8; 4];
                            bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                        }
                    }
                }
                other => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn unexpected(&self) -> MiParseError {
        match self.peek() {
            Some(found) => MiParseError::Unexpected {
                found,
                offset: self.offset,
            },
            None => MiParseError::UnexpectedEnd {
                offset: self.offset,
            },
        }
    }
}
