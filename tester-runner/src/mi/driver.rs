// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Drives a GDB session from a command script.
//!
//! [`MiDriver`] is a state machine: it is fed GDB's output one line at a time and returns the
//! [`DriverAction`]s to perform. Commands are only written when GDB shows its prompt, one per
//! prompt. Threads and pipes are the backend's business.

use super::parser::{AsyncKind, MiRecord, MiValue, ResultClass, StreamKind, parse_line};
use indexmap::IndexMap;
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Commands written when the session has to be stopped.
const EMERGENCY_COMMANDS: [&str; 2] = ["bt", "quit"];

/// The command that stops a running target.
const INTERRUPT_COMMAND: &str = "-exec-interrupt";

/// Something the backend should do.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DriverAction {
    /// Write a line to GDB's input.
    Write(String),

    /// Close GDB's input; the script is done.
    CloseInput,

    /// Debugger chatter for the capture.
    Console(String),

    /// A complete line of target output.
    Target(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Command {
    Line(String),
    EndOfInput,
}

/// A breakpoint GDB reported.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Breakpoint {
    /// The fields of the `bkpt` tuple that are plain strings, such as `number`, `func` and
    /// `line`.
    pub fields: IndexMap<String, String>,
}

impl Breakpoint {
    /// Looks up a field.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// The GDB/MI script state machine.
#[derive(Clone, Debug)]
pub struct MiDriver {
    script: Vec<String>,
    script_line: usize,
    commands: VecDeque<Command>,
    running: bool,
    interrupted: bool,
    input_closed: bool,
    breakpoints: IndexMap<String, Breakpoint>,
    target_output: String,
}

impl MiDriver {
    /// Creates a driver for a script.
    pub fn new(script: Vec<String>) -> Self {
        Self {
            script,
            script_line: 0,
            commands: VecDeque::new(),
            running: false,
            interrupted: false,
            input_closed: false,
            breakpoints: IndexMap::new(),
            target_output: String::new(),
        }
    }

    /// Whether GDB reported the target as running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether the emergency stop sequence was started.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Whether the driver asked for GDB's input to be closed.
    pub fn is_input_closed(&self) -> bool {
        self.input_closed
    }

    /// The breakpoints GDB reported, by number.
    pub fn breakpoints(&self) -> &IndexMap<String, Breakpoint> {
        &self.breakpoints
    }

    /// Handles one line of GDB output.
    pub fn handle_line(&mut self, line: &str) -> Vec<DriverAction> {
        trace!(line, "gdb");
        let mut actions = Vec::new();
        let record = match parse_line(line) {
            Ok(record) => record,
            Err(err) => {
                // Not MI: pass it on as console output.
                trace!(%err, "non-MI line from gdb");
                if !line.trim().is_empty() {
                    actions.push(DriverAction::Console(line.to_owned()));
                }
                return actions;
            }
        };

        match record {
            MiRecord::Prompt => self.on_prompt(&mut actions),
            MiRecord::Result { class, results, .. } => match class {
                ResultClass::Running => self.on_running(),
                ResultClass::Error => {
                    let msg = lookup_str(&results, "msg").unwrap_or("unknown error");
                    warn!(msg, "gdb reported an error");
                    actions.push(DriverAction::Console(format!("error: {msg}")));
                    self.emergency(&mut actions);
                }
                ResultClass::Exit => debug!("gdb exiting"),
                ResultClass::Done | ResultClass::Connected | ResultClass::Other(_) => {}
            },
            MiRecord::Async {
                kind: AsyncKind::Exec,
                class,
                results,
                ..
            } => match class.as_str() {
                "running" => self.on_running(),
                "stopped" => {
                    let reason = lookup_str(&results, "reason").unwrap_or("unknown");
                    debug!(reason, "target stopped");
                    self.running = false;
                }
                _ => {}
            },
            MiRecord::Async {
                kind: AsyncKind::Notify,
                class,
                results,
                ..
            } => self.on_notify(&class, &results),
            MiRecord::Async {
                kind: AsyncKind::Status,
                ..
            } => {}
            MiRecord::Stream { kind, text } => match kind {
                StreamKind::Console | StreamKind::Log => {
                    let text = text.trim_end_matches(['\r', '\n']);
                    if !text.is_empty() {
                        actions.push(DriverAction::Console(text.to_owned()));
                    }
                }
                StreamKind::Target => self.on_target(&text, &mut actions),
            },
        }
        actions
    }

    /// Starts the emergency stop sequence: interrupt the target, print a backtrace and quit.
    ///
    /// Used when the test times out or is killed. Returns nothing if the sequence already started
    /// or input is closed.
    pub fn interrupt(&mut self) -> Vec<DriverAction> {
        let mut actions = Vec::new();
        self.emergency(&mut actions);
        actions
    }

    /// Flushes any partial line of target output. Called when GDB exits.
    pub fn finish(&mut self) -> Vec<DriverAction> {
        let mut actions = Vec::new();
        if !self.target_output.is_empty() {
            let line = std::mem::take(&mut self.target_output);
            actions.push(DriverAction::Target(line.trim_end_matches('\r').to_owned()));
        }
        actions
    }

    // ---
    // Helper methods
    // ---

    fn on_prompt(&mut self, actions: &mut Vec<DriverAction>) {
        if self.input_closed {
            return;
        }
        if self.commands.is_empty() && !self.running {
            if self.script_line < self.script.len() {
                let line = self.script[self.script_line].clone();
                self.script_line += 1;
                self.commands.push_back(Command::Line(line));
            } else if !self.interrupted {
                self.script_line = self.script.len();
                self.commands.push_back(Command::EndOfInput);
            }
        }
        self.flush_one(actions);
    }

    fn flush_one(&mut self, actions: &mut Vec<DriverAction>) {
        match self.commands.pop_front() {
            Some(Command::Line(line)) => {
                debug!(command = %line, "gdb <-");
                actions.push(DriverAction::Write(line));
            }
            Some(Command::EndOfInput) => {
                debug!("gdb script done, closing input");
                self.input_closed = true;
                self.commands.clear();
                actions.push(DriverAction::CloseInput);
            }
            None => {}
        }
    }

    fn on_running(&mut self) {
        self.running = true;
        // Keeps a prompt coming once the target stops.
        self.commands.push_back(Command::Line(String::new()));
    }

    fn on_notify(&mut self, class: &str, results: &[(String, MiValue)]) {
        match class {
            "breakpoint-created" | "breakpoint-modified" => {
                let Some(bkpt) = results
                    .iter()
                    .find(|(name, _)| name == "bkpt")
                    .map(|(_, value)| value)
                else {
                    return;
                };
                let fields = bkpt.const_fields();
                if let Some(number) = fields.get("number").cloned() {
                    debug!(%number, "breakpoint {}", class.trim_start_matches("breakpoint-"));
                    self.breakpoints.insert(number, Breakpoint { fields });
                }
            }
            "breakpoint-deleted" => {
                if let Some(id) = lookup_str(results, "id") {
                    debug!(id, "breakpoint deleted");
                    self.breakpoints.shift_remove(id);
                }
            }
            _ => {}
        }
    }

    fn on_target(&mut self, text: &str, actions: &mut Vec<DriverAction>) {
        self.target_output.push_str(text);
        while let Some(pos) = self.target_output.find('\n') {
            let rest = self.target_output.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.target_output, rest);
            line.truncate(pos);
            if line.ends_with('\r') {
                line.pop();
            }
            actions.push(DriverAction::Target(line));
        }
    }

    fn emergency(&mut self, actions: &mut Vec<DriverAction>) {
        if self.interrupted || self.input_closed {
            return;
        }
        debug!("gdb emergency stop");
        self.interrupted = true;
        // Stop scripting.
        self.script_line = self.script.len();
        self.commands.clear();
        // The target may be running, in which case there is no prompt: write now.
        actions.push(DriverAction::Write(INTERRUPT_COMMAND.to_owned()));
        for command in EMERGENCY_COMMANDS {
            self.commands.push_back(Command::Line(command.to_owned()));
        }
        self.commands.push_back(Command::EndOfInput);
    }
}

fn lookup_str<'a>(results: &'a [(String, MiValue)], name: &str) -> Option<&'a str> {
    results
        .iter()
        .find(|(key, _)| key == name)
        .and_then(|(_, value)| value.as_str())
}
