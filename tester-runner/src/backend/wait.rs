// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{Backend, Completion};
use crate::{
    capture::OutputSink,
    config::Timeouts,
    errors::BackendOpenError,
    monitor::{Monitor, MonitorExit},
};
use std::{sync::Arc, time::Duration};
use tracing::debug;

/// Watches the console of a target that is started some other way, for example by the pretest
/// command.
///
/// The run ends when the test is killed, normally because the classifier saw the end of the test,
/// or when the monitor times out.
#[derive(Debug)]
pub struct WaitBackend {
    timeouts: Timeouts,
    monitor_step: Duration,
    completion: Completion,
}

impl WaitBackend {
    /// Creates a backend with the given timeouts.
    pub fn new(timeouts: Timeouts) -> Self {
        Self {
            timeouts,
            monitor_step: Monitor::DEFAULT_STEP,
            completion: Completion::default(),
        }
    }

    /// Sets the monitor's polling step.
    pub fn with_monitor_step(mut self, step: Duration) -> Self {
        self.monitor_step = step;
        self
    }
}

impl Backend for WaitBackend {
    fn name(&self) -> &'static str {
        "wait"
    }

    fn open(&self, sink: Arc<dyn OutputSink>) -> Result<(), BackendOpenError> {
        let Some(done) = self.completion.arm() else {
            debug!("wait: killed before open");
            return Ok(());
        };
        let exit = Monitor::with_step(self.timeouts, self.monitor_step).run(&done, &*sink);
        debug!(?exit, "wait finished");
        if let MonitorExit::Fired(_) = exit {
            self.completion.signal();
        }
        Ok(())
    }

    fn kill(&self) {
        self.completion.signal();
    }
}
