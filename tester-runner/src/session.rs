// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running a single test.
//!
//! A [`TestSession`] expands the directive script for its executable, runs the pretest command,
//! opens the console and the backend, and collects everything captured into a
//! [`TestResult`]. While the backend runs, every target line goes through the
//! [`Classifier`], whose verdicts stop, restart or reset the target.

mod directive;

pub use directive::{Directive, DirectiveScript};

use crate::{
    backend::{Backend, ExecuteBackend, GdbBackend, TftpBootBackend, WaitBackend},
    capture::{CaptureBuffer, CaptureSource, OutputLength, OutputSink},
    classifier::{Classifier, ClassifierAction, ClassifierConfig},
    config::{Placeholders, TesterSettings, absolute_path},
    errors::{DisplayErrorChain, TestRunError},
    helpers::lock,
    monitor::{Monitor, MonitorEvent},
    report::TestResult,
    target_command::{TargetCommandKind, TargetCommandOutput, run_command, run_target_command},
    test_list::TestInstance,
};
use camino::Utf8PathBuf;
use debug_ignore::DebugIgnore;
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tracing::{debug, info, trace, warn};

/// Runs one test executable.
#[derive(Debug)]
pub struct TestSession {
    settings: Arc<TesterSettings>,
    test: TestInstance,
    full_exe: Utf8PathBuf,
    monitor_step: Duration,
    state: Arc<SessionState>,
}

impl TestSession {
    /// Creates a session for `test`.
    pub fn new(settings: Arc<TesterSettings>, test: TestInstance) -> Self {
        let full_exe = absolute_path(&test.exe);
        let reset_command = settings
            .commands
            .reset
            .as_deref()
            .map(|template| settings.placeholders(&test.exe, &full_exe).expand(template));
        let classifier = Classifier::new(ClassifierConfig {
            start: settings.target_start_regex.clone(),
            reset: settings.target_reset_regex.clone(),
            max_restarts: settings.max_restarts,
        });
        let state = Arc::new(SessionState {
            capture: Mutex::new(CaptureState {
                buffer: CaptureBuffer::new(),
                classifier,
            }),
            length: OutputLength::new(),
            backend: DebugIgnore(Mutex::new(None)),
            killed: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            reset_command,
        });
        Self {
            settings,
            test,
            full_exe,
            monitor_step: Monitor::DEFAULT_STEP,
            state,
        }
    }

    /// Sets the polling step of the backend's monitor.
    pub fn with_monitor_step(mut self, step: Duration) -> Self {
        self.monitor_step = step;
        self
    }

    /// The test this session runs.
    pub fn test(&self) -> &TestInstance {
        &self.test
    }

    /// Returns a handle that can stop the session from another thread.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            state: self.state.clone(),
        }
    }

    /// Runs the test to completion and returns its result.
    pub fn run(self) -> TestResult {
        let started_at = Instant::now();
        let placeholders = self.settings.placeholders(&self.test.exe, &self.full_exe);
        debug!(index = self.test.index, exe = %self.test.exe, "test starting");

        if let Err(err) = self.execute(&placeholders) {
            let chain = DisplayErrorChain::new(&err).to_string();
            warn!(
                index = self.test.index,
                exe = %self.test.exe,
                error = %chain,
                "test did not run to completion"
            );
            for line in chain.lines() {
                self.state.capture_line(CaptureSource::Notice, line);
            }
        }

        let result = self.state.result(&self.test, started_at.elapsed());
        debug!(
            index = result.index,
            exe = %result.exe,
            outcome = %result.outcome,
            duration = ?result.duration,
            "test finished"
        );
        result
    }

    // ---
    // Helper methods
    // ---

    fn execute(&self, placeholders: &Placeholders<'_>) -> Result<(), TestRunError> {
        let script = self.settings.script.expand(placeholders)?;
        self.target_command(TargetCommandKind::Pretest, placeholders);
        let result = self.run_backend(&script);
        self.target_command(TargetCommandKind::Posttest, placeholders);
        result
    }

    fn run_backend(&self, script: &DirectiveScript) -> Result<(), TestRunError> {
        let sink: Arc<dyn OutputSink> = self.state.clone();
        let console = script.console().open(sink.clone())?;

        let backend = self.create_backend(script);
        debug!(backend = backend.name(), console = %script.console(), "opening backend");
        self.state.install_backend(backend.clone());
        backend.target_start();
        let result = backend.open(sink);
        backend.target_end();
        self.state.remove_backend();

        if let Some(console) = console {
            console.close();
        }
        result.map_err(|err| TestRunError::Backend {
            backend: backend.name(),
            err,
        })
    }

    fn create_backend(&self, script: &DirectiveScript) -> Arc<dyn Backend> {
        let timeouts = self.settings.timeouts;
        // With a separate console, the backend's own output is host chatter.
        let output_source = if script.console().is_stdio() {
            CaptureSource::Target
        } else {
            CaptureSource::Console
        };
        match script.backend() {
            Directive::Execute {
                ignore_exit_code,
                command,
            } => Arc::new(
                ExecuteBackend::new(command.clone(), *ignore_exit_code, timeouts, output_source)
                    .with_monitor_step(self.monitor_step),
            ),
            Directive::Gdb { command } => Arc::new(
                GdbBackend::new(command, &self.full_exe, &self.settings.gdb, timeouts)
                    .with_monitor_step(self.monitor_step),
            ),
            Directive::Tftp { port } => {
                let mut tftp = self.settings.tftp.clone();
                if let Some(port) = port {
                    tftp.port = *port;
                }
                Arc::new(
                    TftpBootBackend::new(self.full_exe.clone(), tftp, timeouts)
                        .with_monitor_step(self.monitor_step),
                )
            }
            Directive::Wait | Directive::Console(_) => {
                // A parsed script's backend is never a console directive.
                Arc::new(WaitBackend::new(timeouts).with_monitor_step(self.monitor_step))
            }
        }
    }

    fn target_command(&self, kind: TargetCommandKind, placeholders: &Placeholders<'_>) {
        if let Some(output) = run_target_command(kind, &self.settings.commands, placeholders) {
            self.state.record_command(kind, &output);
        }
    }
}

/// Stops a running [`TestSession`] from another thread.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    state: Arc<SessionState>,
}

impl SessionHandle {
    /// Kills the session's backend. Idempotent; a backend opened later is killed as soon as it
    /// is installed.
    pub fn kill(&self) {
        self.state.killed.store(true, Ordering::Release);
        self.state.kill_backend();
    }

    /// Whether [`kill`](Self::kill) was called.
    pub fn is_killed(&self) -> bool {
        self.state.killed.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct CaptureState {
    buffer: CaptureBuffer,
    classifier: Classifier,
}

/// The state shared between a session, its backend's threads and its console.
#[derive(Debug)]
struct SessionState {
    capture: Mutex<CaptureState>,
    length: OutputLength,
    backend: DebugIgnore<Mutex<Option<Arc<dyn Backend>>>>,
    killed: AtomicBool,
    // Set when the classifier has seen enough, possibly before the backend is installed.
    stop_requested: AtomicBool,
    reset_command: Option<String>,
}

impl SessionState {
    fn install_backend(&self, backend: Arc<dyn Backend>) {
        *lock(&self.backend) = Some(backend.clone());
        if self.killed.load(Ordering::Acquire) || self.stop_requested.load(Ordering::Acquire) {
            backend.kill();
        }
    }

    fn remove_backend(&self) {
        lock(&self.backend).take();
    }

    fn current_backend(&self) -> Option<Arc<dyn Backend>> {
        lock(&self.backend).clone()
    }

    fn kill_backend(&self) {
        if let Some(backend) = self.current_backend() {
            backend.kill();
        }
    }

    fn record_command(&self, kind: TargetCommandKind, output: &TargetCommandOutput) {
        self.capture_line(
            CaptureSource::Notice,
            &format!("target {kind}: {}", output.command),
        );
        for line in output.output.lines() {
            self.capture_line(CaptureSource::Console, line);
        }
        if !output.success() {
            let status = match output.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "no exit code".to_owned(),
            };
            self.capture_line(
                CaptureSource::Notice,
                &format!("target {kind} command failed ({status})"),
            );
        }
    }

    fn reset_target(&self, started: bool) {
        info!(started, "target reset requested");
        if let Some(command) = &self.reset_command {
            let output = run_command(TargetCommandKind::Reset, command.clone());
            self.record_command(TargetCommandKind::Reset, &output);
        }
        if let Some(backend) = self.current_backend() {
            backend.target_reset(started);
        }
    }

    fn result(&self, test: &TestInstance, duration: Duration) -> TestResult {
        let mut capture = lock(&self.capture);
        let classifier = &capture.classifier;
        let outcome = classifier.outcome();
        let label = classifier.label().map(str::to_owned);
        let restarts = classifier.restarts();
        let metadata = classifier.metadata().clone();
        TestResult {
            index: test.index,
            exe: test.exe.clone(),
            outcome,
            label,
            metadata,
            restarts,
            duration,
            output: std::mem::take(&mut capture.buffer),
        }
    }
}

impl OutputSink for SessionState {
    fn capture_line(&self, source: CaptureSource, line: &str) {
        trace!(source = source.prefix(), line, "captured");
        let (action, started) = {
            let mut capture = lock(&self.capture);
            capture.buffer.push(source, line);
            let action = match source {
                CaptureSource::Target => capture.classifier.observe(line),
                CaptureSource::Console | CaptureSource::Notice => ClassifierAction::None,
            };
            (action, capture.classifier.started())
        };

        // Backend hooks run without the capture lock: they may capture lines themselves.
        match action {
            ClassifierAction::None => {}
            ClassifierAction::Kill => {
                debug!("nothing more to wait for, stopping the target");
                self.stop_requested.store(true, Ordering::Release);
                self.kill_backend();
            }
            ClassifierAction::Restart => {
                info!("target restarted before the test began");
                if let Some(backend) = self.current_backend() {
                    backend.target_restart(started);
                }
            }
            ClassifierAction::Reset => self.reset_target(started),
        }
    }

    fn note_activity(&self, bytes: usize) {
        self.length.add(bytes);
    }

    fn output_length(&self) -> u64 {
        self.length.get()
    }

    fn monitor_fired(&self, event: MonitorEvent) {
        let mut capture = lock(&self.capture);
        capture.buffer.push(CaptureSource::Notice, event.marker());
        // The backend stops itself; only the state change matters here.
        let _ = capture.classifier.observe(event.marker());
    }
}
