// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{errors::BackendOpenError, helpers::lock};
use crossbeam_channel::Sender;
use std::{
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// How often the waiter checks whether the child exited.
const WAIT_POLL: Duration = Duration::from_millis(20);

/// Starts `command` in its own process group with piped output.
pub(super) fn spawn_child(command: &[String], stdin: Stdio) -> Result<Child, BackendOpenError> {
    let (program, args) = command
        .split_first()
        .ok_or(BackendOpenError::EmptyCommand)?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    set_process_group(&mut cmd);

    let child = cmd.spawn().map_err(|err| BackendOpenError::Spawn {
        command: shell_words::join(command),
        err,
    })?;
    debug!(pid = child.id(), command = %shell_words::join(command), "spawned child");
    Ok(child)
}

#[cfg(unix)]
fn set_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn set_process_group(_cmd: &mut Command) {}

#[derive(Debug, Default)]
struct SlotInner {
    child: Option<Child>,
    kill_at: Option<Instant>,
}

/// The child process of a backend, shared between the thread that waits for it and whoever
/// kills it.
///
/// The waiter reaps the child and clears the slot under the lock, so a kill only ever signals a
/// process that hasn't been reaped yet.
#[derive(Debug, Default)]
pub(super) struct ProcessSlot {
    inner: Mutex<SlotInner>,
    kill_requested: AtomicBool,
}

impl ProcessSlot {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Stores the child. If a kill was requested before it started, it is killed right away.
    pub(super) fn install(&self, child: Child) {
        let mut inner = lock(&self.inner);
        inner.child = Some(child);
        if self.kill_requested() {
            inner.kill_at = Some(Instant::now());
            kill_now(&mut inner);
        }
    }

    /// Whether [`kill_after`](Self::kill_after) was called.
    pub(super) fn kill_requested(&self) -> bool {
        self.kill_requested.load(Ordering::Acquire)
    }

    /// Requests the child be killed once `grace` has elapsed. A zero grace kills it now.
    ///
    /// Later calls can shorten an earlier deadline but never extend it.
    pub(super) fn kill_after(&self, grace: Duration) {
        self.kill_requested.store(true, Ordering::Release);
        let mut inner = lock(&self.inner);
        let deadline = Instant::now() + grace;
        inner.kill_at = Some(match inner.kill_at {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        if grace.is_zero() {
            kill_now(&mut inner);
        }
    }

    /// Waits for the child to exit, enforcing any kill deadline, then notifies `done`.
    ///
    /// Returns `None` if there was no child or waiting failed.
    pub(super) fn wait(&self, done: &Sender<()>) -> Option<ExitStatus> {
        let status = loop {
            {
                let mut inner = lock(&self.inner);
                let Some(child) = inner.child.as_mut() else {
                    break None;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(pid = child.id(), %status, "child exited");
                        inner.child = None;
                        break Some(status);
                    }
                    Ok(None) => {
                        if inner.kill_at.is_some_and(|at| at <= Instant::now()) {
                            kill_now(&mut inner);
                        }
                    }
                    Err(err) => {
                        warn!(%err, "failed to wait for child");
                        kill_now(&mut inner);
                        inner.child = None;
                        break None;
                    }
                }
            }
            std::thread::sleep(WAIT_POLL);
        };
        let _ = done.send(());
        status
    }
}

fn kill_now(inner: &mut SlotInner) {
    if let Some(child) = inner.child.as_mut() {
        kill_process_group(child);
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    use nix::{
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };
    let Ok(pid) = i32::try_from(child.id()) else {
        return;
    };
    // The group is gone once the child and all its descendants have exited.
    if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(pid, %err, "killpg failed, killing the child only");
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()]
    }

    #[test]
    fn wait_reports_exit_status() {
        let slot = ProcessSlot::new();
        slot.install(spawn_child(&sh("exit 3"), Stdio::null()).expect("spawned"));
        let (tx, rx) = bounded(1);
        let status = slot.wait(&tx).expect("child was waited for");
        assert_eq!(status.code(), Some(3));
        assert!(rx.try_recv().is_ok(), "done was signalled");
        assert!(!slot.kill_requested());
    }

    #[test]
    fn kill_is_idempotent() {
        let slot = ProcessSlot::new();
        slot.install(spawn_child(&sh("sleep 30"), Stdio::null()).expect("spawned"));
        slot.kill_after(Duration::ZERO);
        let (tx, _rx) = bounded(1);
        let status = slot.wait(&tx).expect("child was waited for");
        assert!(!status.success());

        // Killing a reaped child does nothing.
        slot.kill_after(Duration::ZERO);
        slot.kill_after(Duration::ZERO);
        assert!(slot.kill_requested());
        assert!(slot.wait(&tx).is_none());
    }

    #[test]
    fn kill_deadline_is_enforced_by_the_waiter() {
        let slot = ProcessSlot::new();
        slot.install(spawn_child(&sh("sleep 30"), Stdio::null()).expect("spawned"));
        slot.kill_after(Duration::from_millis(100));
        let started = Instant::now();
        let (tx, _rx) = bounded(1);
        slot.wait(&tx).expect("child was waited for");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn kill_before_install() {
        let slot = ProcessSlot::new();
        slot.kill_after(Duration::ZERO);
        slot.install(spawn_child(&sh("sleep 30"), Stdio::null()).expect("spawned"));
        let (tx, _rx) = bounded(1);
        let status = slot.wait(&tx).expect("child was waited for");
        assert!(!status.success());
    }

    #[test]
    fn empty_command() {
        assert!(matches!(
            spawn_child(&[], Stdio::null()),
            Err(BackendOpenError::EmptyCommand)
        ));
    }
}
