// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{Backend, join, process::ProcessSlot, spawn_named};
use crate::{
    capture::{CaptureSource, OutputSink, pump_lines},
    config::Timeouts,
    errors::BackendOpenError,
    helpers::strerror,
    monitor::{Monitor, MonitorExit},
};
use crossbeam_channel::bounded;
use std::{process::Stdio, sync::Arc, time::Duration};
use tracing::{debug, info};

/// Runs a simulator or loader as a child process.
///
/// The child's standard output and error are the target console unless a separate console is
/// configured, in which case they are captured as console output.
#[derive(Debug)]
pub struct ExecuteBackend {
    command: Vec<String>,
    ignore_exit_code: bool,
    timeouts: Timeouts,
    monitor_step: Duration,
    output_source: CaptureSource,
    slot: ProcessSlot,
}

impl ExecuteBackend {
    /// Creates a backend for `command`.
    pub fn new(
        command: Vec<String>,
        ignore_exit_code: bool,
        timeouts: Timeouts,
        output_source: CaptureSource,
    ) -> Self {
        Self {
            command,
            ignore_exit_code,
            timeouts,
            monitor_step: Monitor::DEFAULT_STEP,
            output_source,
            slot: ProcessSlot::new(),
        }
    }

    /// Sets the monitor's polling step.
    pub fn with_monitor_step(mut self, step: Duration) -> Self {
        self.monitor_step = step;
        self
    }
}

impl Backend for ExecuteBackend {
    fn name(&self) -> &'static str {
        "execute"
    }

    fn open(&self, sink: Arc<dyn OutputSink>) -> Result<(), BackendOpenError> {
        let mut child = super::process::spawn_child(&self.command, Stdio::null())?;
        let missing_pipe = |stream| BackendOpenError::MissingPipe {
            command: shell_words::join(&self.command),
            stream,
        };
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;
        self.slot.install(child);

        let (done_tx, done_rx) = bounded(1);
        let sink = &*sink;
        let source = self.output_source;
        let status = std::thread::scope(|scope| {
            let waiter = match spawn_named(scope, "execute-wait", || self.slot.wait(&done_tx)) {
                Ok(waiter) => waiter,
                Err(err) => {
                    self.slot.kill_after(Duration::ZERO);
                    self.slot.wait(&done_tx);
                    return Err(err);
                }
            };
            let readers = [
                spawn_named(scope, "execute-stdout", move || {
                    pump_lines(stdout, source, sink)
                }),
                spawn_named(scope, "execute-stderr", move || {
                    pump_lines(stderr, source, sink)
                }),
            ];
            if let Some(err) = readers.iter().find_map(|reader| reader.as_ref().err()) {
                debug!(%err, "output reader failed to start, killing the child");
                self.slot.kill_after(Duration::ZERO);
            }

            if let MonitorExit::Fired(event) =
                Monitor::with_step(self.timeouts, self.monitor_step).run(&done_rx, sink)
            {
                info!(?event, command = %shell_words::join(&self.command), "killing timed out child");
                self.kill();
            }

            let status = join(waiter);
            let mut first_err = None;
            for reader in readers {
                match reader {
                    Ok(reader) => join(reader),
                    Err(err) => {
                        first_err.get_or_insert(err);
                    }
                }
            }
            match first_err {
                Some(err) => Err(err),
                None => Ok(status),
            }
        })?;

        let code = status.and_then(|status| status.code());
        debug!(?code, killed = self.slot.kill_requested(), "execute finished");
        if let Some(code) = code
            && code != 0
            && !self.ignore_exit_code
            && !self.slot.kill_requested()
        {
            sink.capture_line(
                CaptureSource::Notice,
                &format!("*** TARGET ERROR {code} {} ***", strerror(code)),
            );
        }
        Ok(())
    }

    fn kill(&self) {
        self.slot.kill_after(Duration::ZERO);
    }
}
