// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for `rtems-tester`: runs RTEMS test executables against simulators and
//! boards, classifies each run from the sentinel markers the test firmware prints, and reports
//! the results of many runs executed in parallel.
//!
//! The basic flow is:
//!
//! 1. A [`Scheduler`](scheduler::Scheduler) takes a [`TestList`](test_list::TestList) and runs up
//!    to `jobs` tests at a time, each on its own thread.
//! 2. Each test is driven by a [`TestSession`](session::TestSession), which interprets the
//!    directive script from the [`TesterSettings`](config::TesterSettings) and opens one
//!    [`Backend`](backend::Backend).
//! 3. The backend streams target output into the session's capture, where the
//!    [`Classifier`](classifier::Classifier) tracks the test state, and a
//!    [`Monitor`](monitor::Monitor) enforces the idle and absolute timeouts.
//! 4. Finished tests are recorded in the [`Report`](report::Report) in submission order.

pub mod backend;
pub mod capture;
pub mod classifier;
pub mod config;
pub mod console;
pub mod errors;
pub mod exit_codes;
mod helpers;
pub mod log;
pub mod mi;
pub mod monitor;
pub mod report;
pub mod scheduler;
pub mod session;
pub mod signal;
pub mod target_command;
pub mod test_list;
pub mod tftp;
