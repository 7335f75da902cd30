// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The timeout loop shared by every backend.
//!
//! A [`Monitor`] polls the output length of a test on a fixed cadence. New output resets the idle
//! countdown; the absolute countdown runs regardless. The loop ends when either countdown expires
//! or the backend reports that the test finished on its own.

use crate::{capture::OutputSink, config::Timeouts};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, info};

/// Why the monitor loop fired.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MonitorEvent {
    /// No output arrived for the idle timeout.
    Idle,

    /// The test ran longer than the absolute timeout.
    TooLong,
}

impl MonitorEvent {
    /// The marker line captured for the event. The classifier treats both as end conditions.
    pub fn marker(self) -> &'static str {
        match self {
            Self::Idle => "*** TIMEOUT TIMEOUT",
            Self::TooLong => "*** TEST TOO LONG",
        }
    }
}

/// How a monitor loop ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MonitorExit {
    /// The backend signalled completion.
    Completed,

    /// A countdown expired.
    Fired(MonitorEvent),
}

/// Idle and absolute countdowns, measured in ticks of a fixed step.
#[derive(Clone, Debug)]
pub struct Monitor {
    step: Duration,
    idle_ticks: u64,
    idle_left: u64,
    max_left: u64,
    last_length: u64,
}

impl Monitor {
    /// The default polling step.
    pub const DEFAULT_STEP: Duration = Duration::from_millis(250);

    /// Creates a monitor for the given timeouts with the default step.
    pub fn new(timeouts: Timeouts) -> Self {
        Self::with_step(timeouts, Self::DEFAULT_STEP)
    }

    /// Creates a monitor for the given timeouts with a custom step.
    pub fn with_step(timeouts: Timeouts, step: Duration) -> Self {
        let step = step.max(Duration::from_millis(1));
        let idle_ticks = ticks(timeouts.idle, step);
        Self {
            step,
            idle_ticks,
            idle_left: idle_ticks,
            max_left: ticks(timeouts.max, step),
            last_length: 0,
        }
    }

    /// The polling step.
    pub fn step(&self) -> Duration {
        self.step
    }

    /// Advances the countdowns by one step, given the output length observed now.
    ///
    /// If both countdowns expire on the same tick, the idle timeout wins.
    pub fn tick(&mut self, current_length: u64) -> Option<MonitorEvent> {
        if current_length != self.last_length {
            self.last_length = current_length;
            self.idle_left = self.idle_ticks;
        } else {
            self.idle_left = self.idle_left.saturating_sub(1);
        }
        self.max_left = self.max_left.saturating_sub(1);

        if self.idle_left == 0 {
            Some(MonitorEvent::Idle)
        } else if self.max_left == 0 {
            Some(MonitorEvent::TooLong)
        } else {
            None
        }
    }

    /// Runs the loop until `done` receives a message or disconnects, or a countdown expires.
    ///
    /// On expiry `sink.monitor_fired` is called; stopping the target is up to the caller.
    pub fn run(mut self, done: &Receiver<()>, sink: &dyn OutputSink) -> MonitorExit {
        loop {
            match done.recv_timeout(self.step) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    debug!("monitor: backend completed");
                    return MonitorExit::Completed;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            if let Some(event) = self.tick(sink.output_length()) {
                info!(?event, "monitor fired");
                sink.monitor_fired(event);
                return MonitorExit::Fired(event);
            }
        }
    }
}

fn ticks(duration: Duration, step: Duration) -> u64 {
    let ticks = duration.as_nanos().div_ceil(step.as_nanos());
    u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
}
