// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Target backends.
//!
//! A [`Backend`] runs one test: it starts whatever brings the executable up on the target, streams
//! the target's output into an [`OutputSink`], and supervises the run with a
//! [`Monitor`](crate::monitor::Monitor). [`Backend::open`] blocks the test thread until the run
//! is over; [`Backend::kill`] may be called from any thread at any time, any number of times.
//!
//! There are four backends, one per run directive:
//!
//! * [`ExecuteBackend`] runs a simulator or loader as a child process.
//! * [`GdbBackend`] runs the test under a debugger driven through its machine interface.
//! * [`TftpBootBackend`] serves the executable to a board that boots over the network.
//! * [`WaitBackend`] only watches the console of a board started some other way.

mod execute;
mod gdb;
mod process;
mod tftp;
mod wait;

pub use execute::ExecuteBackend;
pub use gdb::GdbBackend;
pub use tftp::TftpBootBackend;
pub use wait::WaitBackend;

use crate::{capture::OutputSink, errors::BackendOpenError, helpers::lock};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::{
    sync::{Arc, Mutex},
    thread::{Scope, ScopedJoinHandle},
};

/// One way of running a test on a target.
pub trait Backend: Send + Sync {
    /// A short name for logs.
    fn name(&self) -> &'static str;

    /// Runs the test, blocking until it completes, is killed, or times out.
    ///
    /// Output goes to `sink`; a timeout is reported through
    /// [`OutputSink::monitor_fired`]. Errors are returned only when the run could not be set up.
    fn open(&self, sink: Arc<dyn OutputSink>) -> Result<(), BackendOpenError>;

    /// Stops the run. Idempotent, and safe to call before `open`, during it, or after it
    /// returned.
    fn kill(&self);

    /// Called once before `open`.
    fn target_start(&self) {}

    /// Called when the target rebooted before the test began.
    fn target_restart(&self, started: bool) {
        let _ = started;
    }

    /// Called after the target reset command ran.
    fn target_reset(&self, started: bool) {
        let _ = started;
    }

    /// Called once after `open` returns.
    fn target_end(&self) {}
}

/// A one-shot completion signal for backends that don't own a process: `open` waits on it and
/// `kill` fires it.
#[derive(Debug, Default)]
struct Completion {
    inner: Mutex<CompletionInner>,
}

#[derive(Debug, Default)]
struct CompletionInner {
    sender: Option<Sender<()>>,
    signalled: bool,
}

impl Completion {
    /// Returns the receiver to wait on, or `None` if the signal already fired.
    fn arm(&self) -> Option<Receiver<()>> {
        let mut inner = lock(&self.inner);
        if inner.signalled {
            return None;
        }
        let (sender, receiver) = bounded(1);
        inner.sender = Some(sender);
        Some(receiver)
    }

    fn signal(&self) {
        let mut inner = lock(&self.inner);
        inner.signalled = true;
        if let Some(sender) = inner.sender.take() {
            let _ = sender.send(());
        }
    }

    #[cfg(test)]
    fn is_signalled(&self) -> bool {
        lock(&self.inner).signalled
    }
}

/// Spawns a named scoped thread.
fn spawn_named<'scope, T: Send + 'scope>(
    scope: &'scope Scope<'scope, '_>,
    name: &str,
    f: impl FnOnce() -> T + Send + 'scope,
) -> Result<ScopedJoinHandle<'scope, T>, BackendOpenError> {
    std::thread::Builder::new()
        .name(name.to_owned())
        .spawn_scoped(scope, f)
        .map_err(|err| BackendOpenError::Thread {
            name: name.to_owned(),
            err,
        })
}

/// Joins a scoped thread, propagating its panic.
fn join<T>(handle: ScopedJoinHandle<'_, T>) -> T {
    handle
        .join()
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_before_arm() {
        let completion = Completion::default();
        completion.signal();
        completion.signal();
        assert!(completion.is_signalled());
        assert!(completion.arm().is_none());
    }

    #[test]
    fn completion_wakes_the_receiver() {
        let completion = Completion::default();
        let receiver = completion.arm().expect("not signalled yet");
        completion.signal();
        assert!(receiver.recv().is_ok());
    }
}
