// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interrupt handling for a run.
//!
//! The first Ctrl-C is delivered to the scheduler, which kills every running test and stops
//! starting new ones. A second Ctrl-C exits the process right away.

use crate::{errors::SignalHandlerSetupError, exit_codes::TesterExitCode};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::atomic::{AtomicBool, Ordering};

/// A signal the scheduler reacts to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalEvent {
    /// The user pressed Ctrl-C, or the process was asked to terminate.
    Interrupted,
}

/// Receives [`SignalEvent`]s.
#[derive(Debug)]
pub struct SignalHandler {
    pub(crate) receiver: Receiver<SignalEvent>,
    // Held so that a no-op handler's receiver never disconnects.
    _sender: Option<Sender<SignalEvent>>,
}

impl SignalHandler {
    /// Installs the process-wide Ctrl-C handler. Can only be called once per process.
    pub fn new() -> Result<Self, SignalHandlerSetupError> {
        let (sender, receiver) = unbounded();
        let interrupted = AtomicBool::new(false);
        ctrlc::set_handler(move || {
            if interrupted.swap(true, Ordering::AcqRel) {
                std::process::exit(second_interrupt_exit_code());
            }
            let _ = sender.send(SignalEvent::Interrupted);
        })?;
        Ok(Self {
            receiver,
            _sender: None,
        })
    }

    /// Creates a handler that never receives anything.
    pub fn noop() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            receiver,
            _sender: Some(sender),
        }
    }

    /// Creates a handler along with a sender to simulate signals.
    #[cfg(test)]
    pub(crate) fn for_test() -> (Sender<SignalEvent>, Self) {
        let (sender, receiver) = unbounded();
        (
            sender.clone(),
            Self {
                receiver,
                _sender: Some(sender),
            },
        )
    }
}

fn second_interrupt_exit_code() -> i32 {
    if cfg!(unix) {
        TesterExitCode::INTERRUPTED
    } else {
        // STATUS_CONTROL_C_EXIT
        -1073741510
    }
}
