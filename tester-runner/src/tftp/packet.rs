// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! TFTP packets (RFC 1350, with the option extension of RFC 2347).

use crate::errors::PacketParseError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// A TFTP opcode.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Read request.
    Rrq = 1,
    /// Write request.
    Wrq = 2,
    /// Data.
    Data = 3,
    /// Acknowledgement.
    Ack = 4,
    /// Error.
    Error = 5,
    /// Option acknowledgement.
    Oack = 6,
}

impl Opcode {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Rrq),
            2 => Some(Self::Wrq),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            6 => Some(Self::Oack),
            _ => None,
        }
    }
}

/// A TFTP error code.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// Not defined, see the error message.
    NotDefined = 0,
    /// File not found.
    FileNotFound = 1,
    /// Access violation.
    AccessViolation = 2,
    /// Disk full or allocation exceeded.
    DiskFull = 3,
    /// Illegal TFTP operation.
    IllegalOperation = 4,
    /// Unknown transfer ID.
    UnknownTransferId = 5,
    /// File already exists.
    FileExists = 6,
    /// No such user.
    NoSuchUser = 7,
    /// Option negotiation failed.
    OptionNegotiation = 8,
}

impl ErrorCode {
    /// Converts a wire value, if it is a known code.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileExists),
            7 => Some(Self::NoSuchUser),
            8 => Some(Self::OptionNegotiation),
            _ => None,
        }
    }
}

/// A negotiable option: name and value.
///
/// Option names are case-insensitive on the wire; parsed names are lowercased.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TftpOption {
    /// The option name.
    pub name: String,
    /// The option value.
    pub value: String,
}

impl TftpOption {
    /// Creates an option.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A TFTP packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Packet {
    /// A read request.
    ReadRequest {
        /// The requested file.
        filename: String,
        /// The transfer mode, usually `octet`.
        mode: String,
        /// Requested options.
        options: Vec<TftpOption>,
    },

    /// A write request.
    WriteRequest {
        /// The file to write.
        filename: String,
        /// The transfer mode.
        mode: String,
        /// Requested options.
        options: Vec<TftpOption>,
    },

    /// A block of data.
    Data {
        /// The block number.
        block: u16,
        /// The payload.
        data: Bytes,
    },

    /// An acknowledgement.
    Ack {
        /// The acknowledged block number.
        block: u16,
    },

    /// An error.
    Error {
        /// The error code. Unknown codes are preserved.
        code: u16,
        /// A description.
        message: String,
    },

    /// An option acknowledgement.
    OptionAck {
        /// Accepted options.
        options: Vec<TftpOption>,
    },
}

impl Packet {
    /// Creates an error packet.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code: code as u16,
            message: message.into(),
        }
    }

    /// The opcode of the packet.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::ReadRequest { .. } => Opcode::Rrq,
            Self::WriteRequest { .. } => Opcode::Wrq,
            Self::Data { .. } => Opcode::Data,
            Self::Ack { .. } => Opcode::Ack,
            Self::Error { .. } => Opcode::Error,
            Self::OptionAck { .. } => Opcode::Oack,
        }
    }

    /// Parses a datagram.
    pub fn parse(datagram: &[u8]) -> Result<Self, PacketParseError> {
        let mut buf = datagram;
        if buf.len() < 2 {
            return Err(PacketParseError::TooShort { len: datagram.len() });
        }
        let raw = buf.get_u16();
        let opcode = Opcode::from_u16(raw).ok_or(PacketParseError::UnknownOpcode(raw))?;

        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let filename = take_string(&mut buf, "filename")?;
                let mode = take_string(&mut buf, "mode")?;
                let options = take_options(&mut buf)?;
                if opcode == Opcode::Rrq {
                    Ok(Self::ReadRequest {
                        filename,
                        mode,
                        options,
                    })
                } else {
                    Ok(Self::WriteRequest {
                        filename,
                        mode,
                        options,
                    })
                }
            }
            Opcode::Data => {
                if buf.len() < 2 {
                    return Err(PacketParseError::TooShort { len: datagram.len() });
                }
                let block = buf.get_u16();
                Ok(Self::Data {
                    block,
                    data: Bytes::copy_from_slice(buf),
                })
            }
            Opcode::Ack => {
                if buf.len() < 2 {
                    return Err(PacketParseError::TooShort { len: datagram.len() });
                }
                Ok(Self::Ack {
                    block: buf.get_u16(),
                })
            }
            Opcode::Error => {
                if buf.len() < 2 {
                    return Err(PacketParseError::TooShort { len: datagram.len() });
                }
                let code = buf.get_u16();
                // Some clients omit the terminator on error messages.
                let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                let message = String::from_utf8_lossy(&buf[..end]).into_owned();
                Ok(Self::Error { code, message })
            }
            Opcode::Oack => Ok(Self::OptionAck {
                options: take_options(&mut buf)?,
            }),
        }
    }

    /// Encodes the packet into a new buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Appends the encoded packet to `buf`.
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.opcode() as u16);
        match self {
            Self::ReadRequest {
                filename,
                mode,
                options,
            }
            | Self::WriteRequest {
                filename,
                mode,
                options,
            } => {
                put_string(buf, filename);
                put_string(buf, mode);
                put_options(buf, options);
            }
            Self::Data { block, data } => {
                buf.put_u16(*block);
                buf.put_slice(data);
            }
            Self::Ack { block } => buf.put_u16(*block),
            Self::Error { code, message } => {
                buf.put_u16(*code);
                put_string(buf, message);
            }
            Self::OptionAck { options } => put_options(buf, options),
        }
    }

    fn encoded_len(&self) -> usize {
        let options_len = |options: &[TftpOption]| -> usize {
            options
                .iter()
                .map(|o| o.name.len() + o.value.len() + 2)
                .sum()
        };
        2 + match self {
            Self::ReadRequest {
                filename,
                mode,
                options,
            }
            | Self::WriteRequest {
                filename,
                mode,
                options,
            } => filename.len() + mode.len() + 2 + options_len(options),
            Self::Data { data, .. } => 2 + data.len(),
            Self::Ack { .. } => 2,
            Self::Error { message, .. } => 2 + message.len() + 1,
            Self::OptionAck { options } => options_len(options),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadRequest { filename, mode, .. } => write!(f, "RRQ {filename} ({mode})"),
            Self::WriteRequest { filename, mode, .. } => write!(f, "WRQ {filename} ({mode})"),
            Self::Data { block, data } => write!(f, "DATA #{block} ({} bytes)", data.len()),
            Self::Ack { block } => write!(f, "ACK #{block}"),
            Self::Error { code, message } => write!(f, "ERROR {code}: {message}"),
            Self::OptionAck { options } => {
                write!(f, "OACK")?;
                for option in options {
                    write!(f, " {}={}", option.name, option.value)?;
                }
                Ok(())
            }
        }
    }
}

fn take_string(buf: &mut &[u8], field: &'static str) -> Result<String, PacketParseError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(PacketParseError::Unterminated { field })?;
    let text = std::str::from_utf8(&buf[..end])
        .map_err(|_| PacketParseError::InvalidText { field })?
        .to_owned();
    buf.advance(end + 1);
    Ok(text)
}

fn take_options(buf: &mut &[u8]) -> Result<Vec<TftpOption>, PacketParseError> {
    let mut options = Vec::new();
    while buf.has_remaining() {
        let name = take_string(buf, "option name")?;
        if name.is_empty() {
            // Padding after the last option.
            continue;
        }
        if !buf.has_remaining() {
            return Err(PacketParseError::MissingOptionValue { name });
        }
        let value = take_string(buf, "option value")?;
        options.push(TftpOption {
            name: name.to_ascii_lowercase(),
            value,
        });
    }
    Ok(options)
}

fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_options(buf: &mut impl BufMut, options: &[TftpOption]) {
    for option in options {
        put_string(buf, &option.name);
        put_string(buf, &option.value);
    }
}
