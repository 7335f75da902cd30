// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{Backend, join, process::ProcessSlot, spawn_named};
use crate::{
    capture::{CaptureSource, LineAssembler, OutputSink, pump_lines},
    config::{GdbSettings, Timeouts},
    errors::BackendOpenError,
    helpers::lock,
    mi::{DriverAction, MiDriver},
    monitor::{Monitor, MonitorExit},
};
use camino::Utf8Path;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use std::{
    io::{self, Read, Write},
    process::{ChildStdin, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tracing::{debug, info, trace};

/// How often the writer checks whether the debugger exited while no input is queued.
const WRITER_POLL: Duration = Duration::from_millis(250);

/// Arguments that put the debugger in machine-interface mode without reading any init files.
const MI_ARGS: [&str; 3] = ["--interpreter=mi", "--nx", "--nh"];

#[derive(Debug)]
enum WriterMessage {
    Line(String),
    Close,
}

/// Runs the test under a debugger, sending one script command per prompt.
///
/// Target output arrives as MI target stream records and is captured as target output; everything
/// else the debugger prints is captured as console output. Killing the test interrupts the target,
/// asks for a backtrace and quits, then kills the debugger if it hasn't exited within the grace
/// period.
#[derive(Debug)]
pub struct GdbBackend {
    command: Vec<String>,
    quit_grace: Duration,
    timeouts: Timeouts,
    monitor_step: Duration,
    slot: ProcessSlot,
    driver: Mutex<MiDriver>,
    input: Mutex<Option<Sender<WriterMessage>>>,
}

impl GdbBackend {
    /// Creates a backend running `command` on `exe`.
    pub fn new(command: &[String], exe: &Utf8Path, settings: &GdbSettings, timeouts: Timeouts) -> Self {
        let mut full_command = command.to_vec();
        full_command.extend(MI_ARGS.iter().map(|arg| (*arg).to_owned()));
        full_command.push(exe.to_string());
        Self {
            command: full_command,
            quit_grace: settings.quit_grace,
            timeouts,
            monitor_step: Monitor::DEFAULT_STEP,
            slot: ProcessSlot::new(),
            driver: Mutex::new(MiDriver::new(settings.script.clone())),
            input: Mutex::new(None),
        }
    }

    /// Sets the monitor's polling step.
    pub fn with_monitor_step(mut self, step: Duration) -> Self {
        self.monitor_step = step;
        self
    }

    /// The full debugger command line.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    fn send(&self, message: WriterMessage) {
        if let Some(input) = lock(&self.input).as_ref() {
            let _ = input.send(message);
        }
    }

    fn dispatch(&self, actions: Vec<DriverAction>, sink: &dyn OutputSink) {
        for action in actions {
            match action {
                DriverAction::Write(line) => self.send(WriterMessage::Line(line)),
                DriverAction::CloseInput => self.send(WriterMessage::Close),
                DriverAction::Console(text) => sink.capture_line(CaptureSource::Console, &text),
                DriverAction::Target(text) => {
                    sink.note_activity(text.len() + 1);
                    sink.capture_line(CaptureSource::Target, &text);
                }
            }
        }
    }

    fn read_output(&self, mut stdout: impl Read, sink: &dyn OutputSink) {
        let mut assembler = LineAssembler::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    trace!(%err, "gdb output closed with error");
                    break;
                }
            };
            assembler.push(&buf[..n], |line| {
                // The driver lock is released before dispatching: a captured line can kill the
                // test, which takes it again.
                let actions = lock(&self.driver).handle_line(line);
                self.dispatch(actions, sink);
            });
        }
        assembler.finish(|line| {
            let actions = lock(&self.driver).handle_line(line);
            self.dispatch(actions, sink);
        });
        let actions = lock(&self.driver).finish();
        self.dispatch(actions, sink);
    }
}

fn write_input(mut stdin: ChildStdin, input: Receiver<WriterMessage>, exited: &AtomicBool) {
    loop {
        match input.recv_timeout(WRITER_POLL) {
            Ok(WriterMessage::Line(line)) => {
                let written = writeln!(stdin, "{line}").and_then(|()| stdin.flush());
                if let Err(err) = written {
                    debug!(%err, "gdb input closed");
                    break;
                }
            }
            Ok(WriterMessage::Close) => {
                debug!("closing gdb input");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if exited.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

impl Backend for GdbBackend {
    fn name(&self) -> &'static str {
        "gdb"
    }

    fn open(&self, sink: Arc<dyn OutputSink>) -> Result<(), BackendOpenError> {
        let mut child = super::process::spawn_child(&self.command, Stdio::piped())?;
        let missing_pipe = |stream| BackendOpenError::MissingPipe {
            command: shell_words::join(&self.command),
            stream,
        };
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;
        self.slot.install(child);

        let (input_tx, input_rx) = unbounded();
        *lock(&self.input) = Some(input_tx);

        let (done_tx, done_rx) = bounded(1);
        let exited = AtomicBool::new(false);
        let sink = &*sink;
        let result = std::thread::scope(|scope| {
            let waiter = spawn_named(scope, "gdb-wait", || {
                let status = self.slot.wait(&done_tx);
                exited.store(true, Ordering::Release);
                status
            });
            let waiter = match waiter {
                Ok(waiter) => waiter,
                Err(err) => {
                    self.slot.kill_after(Duration::ZERO);
                    self.slot.wait(&done_tx);
                    return Err(err);
                }
            };
            let exited = &exited;
            let workers = [
                spawn_named(scope, "gdb-stdin", move || write_input(stdin, input_rx, exited)),
                spawn_named(scope, "gdb-stdout", move || self.read_output(stdout, sink)),
                spawn_named(scope, "gdb-stderr", move || {
                    pump_lines(stderr, CaptureSource::Console, sink)
                }),
            ];
            if let Some(err) = workers.iter().find_map(|worker| worker.as_ref().err()) {
                debug!(%err, "gdb worker failed to start, killing gdb");
                self.slot.kill_after(Duration::ZERO);
            }

            if let MonitorExit::Fired(event) =
                Monitor::with_step(self.timeouts, self.monitor_step).run(&done_rx, sink)
            {
                info!(?event, "stopping gdb after timeout");
                self.kill();
            }

            let status = join(waiter);
            debug!(?status, "gdb exited");
            // Disconnects the writer if it's still waiting.
            lock(&self.input).take();

            let mut first_err = None;
            for worker in workers {
                match worker {
                    Ok(worker) => join(worker),
                    Err(err) => {
                        first_err.get_or_insert(err);
                    }
                }
            }
            first_err.map_or(Ok(()), Err)
        });
        lock(&self.input).take();
        result
    }

    fn kill(&self) {
        let actions = lock(&self.driver).interrupt();
        for action in actions {
            match action {
                DriverAction::Write(line) => self.send(WriterMessage::Line(line)),
                DriverAction::CloseInput => self.send(WriterMessage::Close),
                DriverAction::Console(_) | DriverAction::Target(_) => {}
            }
        }
        self.slot.kill_after(self.quit_grace);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{capture::test_helpers::RecordingSink, monitor::MonitorEvent};
    use pretty_assertions::assert_eq;

    fn fake_gdb(script: &str) -> Vec<String> {
        // The MI arguments and the executable land in $0, $1...
        vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()]
    }

    fn settings(script: &[&str], quit_grace_ms: u64) -> GdbSettings {
        GdbSettings {
            script: script.iter().map(|line| (*line).to_owned()).collect(),
            quit_grace: Duration::from_millis(quit_grace_ms),
        }
    }

    #[test]
    fn command_line() {
        let backend = GdbBackend::new(
            &["sparc-rtems6-gdb".to_owned()],
            Utf8Path::new("/b/hello.exe"),
            &settings(&["target sim"], 100),
            Timeouts {
                idle: Duration::from_secs(1),
                max: Duration::from_secs(1),
            },
        );
        assert_eq!(
            backend.command(),
            &["sparc-rtems6-gdb", "--interpreter=mi", "--nx", "--nh", "/b/hello.exe"]
        );
    }

    #[test]
    fn script_and_target_output() {
        let gdb = fake_gdb(
            r#"printf '(gdb)\n'; read a; printf '~"%s\\n"\n' "$a"
printf '@"*** BEGIN OF TEST G ***\\n"\n'; printf '@"*** END OF TEST G ***\\n"\n'
printf '(gdb)\n'; read b; printf '~"%s\\n"\n' "$b"; printf '^exit\n'"#,
        );
        let backend = GdbBackend::new(
            &gdb,
            Utf8Path::new("hello.exe"),
            &settings(&["target sim", "run"], 100),
            Timeouts {
                idle: Duration::from_secs(30),
                max: Duration::from_secs(60),
            },
        )
        .with_monitor_step(Duration::from_millis(10));
        let sink = Arc::new(RecordingSink::default());
        backend.open(sink.clone()).expect("opened");

        assert_eq!(
            sink.lines(CaptureSource::Target),
            vec!["*** BEGIN OF TEST G ***", "*** END OF TEST G ***"]
        );
        assert_eq!(sink.lines(CaptureSource::Console), vec!["target sim", "run"]);
        assert!(sink.output_length() > 0);
    }

    #[test]
    fn timeout_interrupts_then_kills() {
        let gdb = fake_gdb(r#"printf '(gdb)\n'; while read l; do printf '~"%s\\n"\n' "$l"; done"#);
        let backend = GdbBackend::new(
            &gdb,
            Utf8Path::new("hello.exe"),
            &settings(&["run"], 200),
            Timeouts {
                idle: Duration::from_millis(200),
                max: Duration::from_secs(60),
            },
        )
        .with_monitor_step(Duration::from_millis(10));
        let sink = Arc::new(RecordingSink::default());
        backend.open(sink.clone()).expect("opened");

        assert_eq!(*lock(&sink.events), vec![MonitorEvent::Idle]);
        let console = sink.lines(CaptureSource::Console);
        assert_eq!(console.first().map(String::as_str), Some("run"));
        assert!(
            console.iter().any(|line| line == "-exec-interrupt"),
            "interrupt was sent: {console:?}"
        );
        backend.kill();
    }
}
