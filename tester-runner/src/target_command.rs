// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shell commands that control the target: power, per-test hooks and reset.
//!
//! Commands are run through the shell with their output captured. A command that fails to start
//! or exits non-zero is logged and otherwise ignored; target control is best effort.

use crate::config::{Placeholders, TargetCommandTemplates};
use duct::cmd;
use std::fmt;
use tracing::{debug, warn};

/// Which configured command to run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TargetCommandKind {
    /// Power on, before the first test.
    On,
    /// Power off, after the last test.
    Off,
    /// Before each test.
    Pretest,
    /// After each test.
    Posttest,
    /// When the reset pattern is seen.
    Reset,
}

impl TargetCommandKind {
    /// The name used in configuration keys and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Pretest => "pretest",
            Self::Posttest => "posttest",
            Self::Reset => "reset",
        }
    }

    /// Picks the template for this kind.
    pub fn template(self, templates: &TargetCommandTemplates) -> Option<&str> {
        match self {
            Self::On => templates.on.as_deref(),
            Self::Off => templates.off.as_deref(),
            Self::Pretest => templates.pretest.as_deref(),
            Self::Posttest => templates.posttest.as_deref(),
            Self::Reset => templates.reset.as_deref(),
        }
    }
}

impl fmt::Display for TargetCommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of running a target command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetCommandOutput {
    /// The command after placeholder expansion.
    pub command: String,

    /// The exit code; `None` if the command didn't start or was killed by a signal.
    pub exit_code: Option<i32>,

    /// Combined standard output and error.
    pub output: String,
}

impl TargetCommandOutput {
    /// Whether the command ran and exited with zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs the configured command of `kind`, if any.
pub fn run_target_command(
    kind: TargetCommandKind,
    templates: &TargetCommandTemplates,
    placeholders: &Placeholders<'_>,
) -> Option<TargetCommandOutput> {
    let template = kind.template(templates)?;
    let command = placeholders.expand(template);
    Some(run_command(kind, command))
}

/// Runs an already expanded command through the shell.
pub fn run_command(kind: TargetCommandKind, command: String) -> TargetCommandOutput {
    debug!(%kind, %command, "running target command");
    let expression = if cfg!(windows) {
        cmd!("cmd", "/C", &command)
    } else {
        cmd!("sh", "-c", &command)
    };
    let result = expression
        .stderr_to_stdout()
        .stdout_capture()
        .stdin_null()
        .unchecked()
        .run();

    match result {
        Ok(output) => {
            let exit_code = output.status.code();
            let text = String::from_utf8_lossy(&output.stdout).into_owned();
            if output.status.success() {
                debug!(%kind, "target command succeeded");
            } else {
                warn!(%kind, %command, ?exit_code, output = %text.trim_end(), "target command failed");
            }
            TargetCommandOutput {
                command,
                exit_code,
                output: text,
            }
        }
        Err(err) => {
            warn!(%kind, %command, %err, "target command failed to start");
            TargetCommandOutput {
                command,
                exit_code: None,
                output: String::new(),
            }
        }
    }
}
