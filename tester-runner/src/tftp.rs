// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A small TFTP server for network-booting targets.
//!
//! The server only answers read requests and serves one session at a time: only one target may
//! boot from it at once. Each session talks from a fresh ephemeral port, as TFTP transfer IDs
//! require. Protocol errors are answered on the wire with an ERROR packet and never stop the
//! server.

mod packet;
mod server;

pub use packet::*;
pub use server::*;
