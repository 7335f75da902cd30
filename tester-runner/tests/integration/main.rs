// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod fixtures;
#[cfg(unix)]
mod run;
mod tftp;
