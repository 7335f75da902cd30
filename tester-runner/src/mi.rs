// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The GDB machine interface: a record parser and the script driver used by the debugger
//! backend.

mod driver;
mod parser;

pub use driver::*;
pub use parser::*;
