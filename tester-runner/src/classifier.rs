// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Classifies a test run from the sentinel markers printed by the test firmware.
//!
//! RTEMS tests bracket their output with `*** BEGIN OF TEST <label> ***` and
//! `*** END OF TEST <label> ***`, and may declare an explicit state with
//! `*** TEST STATE: <STATE> ***`. The [`Classifier`] consumes target lines one at a time, tracks
//! the test state, and tells the caller when the target can be stopped early or needs a restart or
//! reset. [`Classifier::outcome`] derives the final [`Outcome`].

use crate::report::Outcome;
use regex::Regex;
use std::{fmt, sync::LazyLock};
use tracing::{debug, warn};

static BEGIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*\* BEGIN OF TEST (.*?) \*\*\*").expect("valid regex"));
static END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*\* END OF TEST (.*?) \*\*\*").expect("valid regex"));
static STATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*\* TEST STATE: ([A-Za-z_-]+)").expect("valid regex"));
static VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*\* TEST VERSION: (.*)").expect("valid regex"));
static BUILD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*\* TEST BUILD:(.*)").expect("valid regex"));
static TOOLS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*\* TEST TOOLS: (.*)").expect("valid regex"));

/// Markers which end a test whatever its label.
const END_CONDITIONS: &[&str] = &[
    "*** FATAL ***",
    "[ RTEMS shutdown ]",
    "*** TIMEOUT TIMEOUT",
    "*** TEST TOO LONG",
];

/// Markers recording that the test timed out.
const TIMEOUT_MARKERS: &[&str] = &["*** TIMEOUT TIMEOUT", "*** TEST TOO LONG"];

/// An explicit test state declared by the firmware.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TestState {
    /// The test needs interactive input and can't be judged automatically.
    UserInput,

    /// The test is a benchmark.
    Benchmark,

    /// The test is known to fail on this target.
    ExpectedFail,

    /// The result of the test can't be determined automatically.
    Indeterminate,
}

impl TestState {
    /// Parses a state name. `-` and `_` are equivalent. `EXPECTED_PASS` and unknown names
    /// return `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().replace('-', "_").as_str() {
            "USER_INPUT" => Some(Self::UserInput),
            "BENCHMARK" => Some(Self::Benchmark),
            "EXPECTED_FAIL" => Some(Self::ExpectedFail),
            "INDETERMINATE" => Some(Self::Indeterminate),
            _ => None,
        }
    }

    /// The state as the firmware writes it.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserInput => "USER_INPUT",
            Self::Benchmark => "BENCHMARK",
            Self::ExpectedFail => "EXPECTED_FAIL",
            Self::Indeterminate => "INDETERMINATE",
        }
    }

    /// Whether the target may be stopped as soon as this state is seen.
    pub fn is_killable(self) -> bool {
        // Every explicit state ends the useful part of a run.
        true
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata banners printed by the test firmware.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TestMetadata {
    /// The `TEST VERSION` banner.
    pub version: Option<String>,

    /// The `TEST BUILD` banner, split into words.
    pub build: Vec<String>,

    /// The `TEST TOOLS` banner.
    pub tools: Option<String>,
}

/// Patterns and limits the classifier is configured with.
#[derive(Clone, Debug, Default)]
pub struct ClassifierConfig {
    /// Matches the target's boot banner.
    pub start: Option<Regex>,

    /// Matches output that requires the target to be reset.
    pub reset: Option<Regex>,

    /// How many restarts are allowed before the test starts.
    pub max_restarts: u32,
}

/// What the caller should do after a line is observed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClassifierAction {
    /// Nothing.
    None,

    /// The run has nothing more to say: stop the target. Returned once per run.
    Kill,

    /// The target restarted before the test began: let the backend re-arm.
    Restart,

    /// The target asked to be reset.
    Reset,
}

/// The per-test marker state machine.
#[derive(Clone, Debug)]
pub struct Classifier {
    config: ClassifierConfig,
    label: Option<String>,
    started: bool,
    ended: bool,
    // Only the matching END marker completes a test; FATAL and shutdown just end the run.
    end_marker_seen: bool,
    state: Option<TestState>,
    timeout_seen: bool,
    restarts: u32,
    kill_requested: bool,
    metadata: TestMetadata,
}

impl Classifier {
    /// Creates a classifier in the not-started state.
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            label: None,
            started: false,
            ended: false,
            end_marker_seen: false,
            state: None,
            timeout_seen: false,
            restarts: 0,
            kill_requested: false,
            metadata: TestMetadata::default(),
        }
    }

    /// Whether the BEGIN marker was seen.
    pub fn started(&self) -> bool {
        self.started
    }

    /// Whether an end condition was seen.
    pub fn ended(&self) -> bool {
        self.ended
    }

    /// The label from the BEGIN marker.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// The explicit state, if one was declared.
    pub fn state(&self) -> Option<TestState> {
        self.state
    }

    /// How many times the target restarted before the test began.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Whether the target may be stopped now.
    pub fn ok_to_kill(&self) -> bool {
        self.kill_requested
    }

    /// The metadata banners seen so far.
    pub fn metadata(&self) -> &TestMetadata {
        &self.metadata
    }

    /// Consumes the classifier, returning the metadata banners.
    pub fn into_metadata(self) -> TestMetadata {
        self.metadata
    }

    /// Observes one line of target output.
    pub fn observe(&mut self, line: &str) -> ClassifierAction {
        if !self.started {
            if let Some(caps) = BEGIN.captures(line) {
                let label = caps[1].trim().to_owned();
                debug!(%label, "test started");
                self.label = Some(label);
                self.started = true;
                return ClassifierAction::None;
            }
        } else if !self.ended {
            if let Some(caps) = END.captures(line) {
                if self.label.as_deref() == Some(caps[1].trim()) {
                    debug!(label = ?self.label, "test ended");
                    self.ended = true;
                    self.end_marker_seen = true;
                    return self.request_kill();
                }
                warn!(line, expected = ?self.label, "end marker label does not match");
            }
        }

        if let Some(marker) = END_CONDITIONS.iter().find(|marker| line.contains(**marker)) {
            if TIMEOUT_MARKERS.contains(marker) {
                self.timeout_seen = true;
            }
            self.ended = true;
            return self.request_kill();
        }

        if let Some(caps) = STATE.captures(line) {
            match TestState::parse(&caps[1]) {
                Some(state) => {
                    debug!(%state, "explicit test state");
                    self.state = Some(state);
                    if state.is_killable() {
                        return self.request_kill();
                    }
                }
                None => self.state = None,
            }
            return ClassifierAction::None;
        }

        if self.observe_metadata(line) {
            return ClassifierAction::None;
        }

        if let Some(start) = &self.config.start {
            if start.is_match(line) {
                if self.started {
                    warn!(line, "target restarted during the test");
                    return self.request_kill();
                }
                self.restarts += 1;
                if self.restarts > self.config.max_restarts {
                    warn!(
                        restarts = self.restarts,
                        max_restarts = self.config.max_restarts,
                        "too many target restarts"
                    );
                    return self.request_kill();
                }
                debug!(restarts = self.restarts, "target restarted");
                return ClassifierAction::Restart;
            }
        }

        if let Some(reset) = &self.config.reset {
            let killable = self.state.is_some_and(TestState::is_killable);
            if !killable && reset.is_match(line) {
                debug!(line, "target reset requested");
                return ClassifierAction::Reset;
            }
        }

        ClassifierAction::None
    }

    /// Derives the final outcome.
    pub fn outcome(&self) -> Outcome {
        let complete = self.started && self.end_marker_seen;
        match self.state {
            Some(TestState::UserInput) => Outcome::UserInput,
            Some(TestState::Benchmark) => Outcome::Benchmark,
            Some(TestState::ExpectedFail) if complete => Outcome::Passed,
            Some(TestState::ExpectedFail) => Outcome::ExpectedFail,
            Some(TestState::Indeterminate) if complete => Outcome::Passed,
            Some(TestState::Indeterminate) => Outcome::Indeterminate,
            None if self.timeout_seen => Outcome::Timeout,
            None if complete => Outcome::Passed,
            None if self.started => Outcome::Failed,
            None => Outcome::Invalid,
        }
    }

    fn request_kill(&mut self) -> ClassifierAction {
        if self.kill_requested {
            ClassifierAction::None
        } else {
            self.kill_requested = true;
            ClassifierAction::Kill
        }
    }

    fn observe_metadata(&mut self, line: &str) -> bool {
        if let Some(caps) = VERSION.captures(line) {
            self.metadata.version = Some(caps[1].trim().to_owned());
        } else if let Some(caps) = BUILD.captures(line) {
            self.metadata.build = caps[1].split_whitespace().map(str::to_owned).collect();
        } else if let Some(caps) = TOOLS.captures(line) {
            self.metadata.tools = Some(caps[1].trim().to_owned());
        } else {
            return false;
        }
        true
    }
}
