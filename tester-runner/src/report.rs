// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Aggregates test outcomes and writes them to the run log.
//!
//! The main structure in this module is [`Report`]. It is shared by all test threads; the
//! scheduler calls [`Report::start`] when a test starts and [`Report::finish`] in submission order
//! when tests finish.

use crate::{
    capture::CaptureBuffer,
    classifier::TestMetadata,
    errors::ReportModeParseError,
    helpers::{lock, plural},
    log::{RunLog, Styles},
};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, FixedOffset, Local};
use owo_colors::{OwoColorize, Style};
use std::{
    fmt,
    str::FromStr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use swrite::{SWrite, swrite};

/// The terminal outcome of a test.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Outcome {
    /// The test began and ended.
    Passed,

    /// The test began but never ended.
    Failed,

    /// The test went quiet for too long or ran too long.
    Timeout,

    /// The test declared that its result can't be determined.
    Indeterminate,

    /// The test is known to fail and didn't complete.
    ExpectedFail,

    /// The test needs interactive input.
    UserInput,

    /// The test is a benchmark.
    Benchmark,

    /// The test never began.
    Invalid,
}

impl Outcome {
    /// All outcomes, in report order.
    pub const ALL: [Outcome; 8] = [
        Outcome::Passed,
        Outcome::Failed,
        Outcome::UserInput,
        Outcome::ExpectedFail,
        Outcome::Indeterminate,
        Outcome::Benchmark,
        Outcome::Timeout,
        Outcome::Invalid,
    ];

    /// The outcome's name in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Indeterminate => "indeterminate",
            Self::ExpectedFail => "expected-fail",
            Self::UserInput => "user-input",
            Self::Benchmark => "benchmark",
            Self::Invalid => "invalid",
        }
    }

    /// The single-letter tag used in progress lines.
    pub fn tag(self) -> char {
        match self {
            Self::Passed => 'p',
            Self::Failed => 'f',
            Self::UserInput => 'u',
            Self::ExpectedFail => 'e',
            Self::Indeterminate => 'I',
            Self::Benchmark => 'B',
            Self::Timeout => 't',
            Self::Invalid => 'i',
        }
    }

    /// Whether the outcome makes the run unsuccessful.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Timeout | Self::Invalid)
    }

    fn style(self, styles: &Styles) -> Style {
        match self {
            Self::Passed => styles.pass,
            Self::Failed | Self::Invalid => styles.fail,
            _ => styles.skip,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much captured output is written to the log for a finished test.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReportMode {
    /// Output for every test.
    All,

    /// Output for failed, timed out and invalid tests.
    #[default]
    Failures,

    /// No output, only results.
    None,
}

impl ReportMode {
    /// Returns string representations of all known variants.
    pub fn variants() -> &'static [&'static str] {
        &["all", "failures", "none"]
    }

    /// Whether output is written for a test with this outcome.
    pub fn includes_output(self, outcome: Outcome) -> bool {
        match self {
            Self::All => true,
            Self::Failures => outcome.is_failure(),
            Self::None => false,
        }
    }
}

impl FromStr for ReportMode {
    type Err = ReportModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let val = match s {
            "all" => ReportMode::All,
            "failures" => ReportMode::Failures,
            "none" => ReportMode::None,
            other => return Err(ReportModeParseError::new(other)),
        };
        Ok(val)
    }
}

impl fmt::Display for ReportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportMode::All => write!(f, "all"),
            ReportMode::Failures => write!(f, "failures"),
            ReportMode::None => write!(f, "none"),
        }
    }
}

/// Per-outcome counts.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OutcomeCounts {
    counts: [usize; 8],
}

impl OutcomeCounts {
    /// Returns the count for `outcome`.
    pub fn get(&self, outcome: Outcome) -> usize {
        self.counts[Self::slot(outcome)]
    }

    /// Adds one to the count for `outcome`.
    pub fn add(&mut self, outcome: Outcome) {
        self.counts[Self::slot(outcome)] += 1;
    }

    /// The sum over all outcomes.
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// The number of failed, timed out and invalid tests.
    pub fn failures(&self) -> usize {
        Outcome::ALL
            .iter()
            .filter(|outcome| outcome.is_failure())
            .map(|outcome| self.get(*outcome))
            .sum()
    }

    fn slot(outcome: Outcome) -> usize {
        outcome as usize
    }
}

/// The result of one test.
#[derive(Clone, Debug)]
pub struct TestResult {
    /// The 1-based submission index.
    pub index: usize,

    /// The executable.
    pub exe: Utf8PathBuf,

    /// The outcome.
    pub outcome: Outcome,

    /// The label from the BEGIN marker.
    pub label: Option<String>,

    /// Metadata banners printed by the test.
    pub metadata: TestMetadata,

    /// How many times the target restarted before the test began.
    pub restarts: u32,

    /// Wall time for the test.
    pub duration: Duration,

    /// Everything captured during the test.
    pub output: CaptureBuffer,
}

impl TestResult {
    /// The short name of the test: the executable's file name.
    pub fn name(&self) -> &str {
        test_name(&self.exe)
    }
}

fn test_name(exe: &Utf8Path) -> &str {
    exe.file_name().unwrap_or(exe.as_str())
}

/// Counts and the names of non-passing tests, once a run is over.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    /// The number of tests submitted.
    pub total: usize,

    /// Per-outcome counts.
    pub counts: OutcomeCounts,

    /// Non-passing tests by outcome, in submission order.
    pub non_passing: Vec<(Outcome, String)>,

    /// Whether the run was interrupted.
    pub interrupted: bool,

    /// When the run started.
    pub start_time: DateTime<FixedOffset>,

    /// Wall time for the run.
    pub elapsed: Duration,
}

impl RunSummary {
    /// Returns true if no test failed, timed out or was invalid and the run wasn't interrupted.
    pub fn is_success(&self) -> bool {
        !self.interrupted && self.counts.failures() == 0
    }

    /// The number of tests that finished.
    pub fn finished(&self) -> usize {
        self.counts.total()
    }
}

#[derive(Debug, Default)]
struct ReportInner {
    counts: OutcomeCounts,
    non_passing: Vec<(Outcome, String)>,
    interrupted: bool,
}

/// The report for a run. Shared across test threads.
#[derive(Debug)]
pub struct Report {
    log: Arc<RunLog>,
    arch: String,
    bsp: String,
    total: usize,
    mode: ReportMode,
    start_time: DateTime<FixedOffset>,
    started_at: Instant,
    inner: Mutex<ReportInner>,
}

impl Report {
    /// Creates a report for `total` tests.
    pub fn new(
        log: Arc<RunLog>,
        arch: impl Into<String>,
        bsp: impl Into<String>,
        total: usize,
        mode: ReportMode,
    ) -> Self {
        Self {
            log,
            arch: arch.into(),
            bsp: bsp.into(),
            total,
            mode,
            start_time: Local::now().fixed_offset(),
            started_at: Instant::now(),
            inner: Mutex::new(ReportInner::default()),
        }
    }

    /// The run log.
    pub fn log(&self) -> &Arc<RunLog> {
        &self.log
    }

    /// The number of tests submitted.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Writes the progress line for a test that is starting.
    pub fn start(&self, index: usize, exe: &Utf8Path) {
        let counts = lock(&self.inner).counts;
        let line = self.progress_line(index, &counts, exe);
        self.log.notice(&line);
    }

    /// Records a finished test and writes its result and output per the report mode.
    pub fn finish(&self, result: TestResult) {
        {
            let mut inner = lock(&self.inner);
            inner.counts.add(result.outcome);
            if result.outcome != Outcome::Passed {
                inner
                    .non_passing
                    .push((result.outcome, result.name().to_owned()));
            }
        }

        let mut lines = Vec::new();
        lines.push(self.result_line(&result));
        if let Some(version) = &result.metadata.version {
            lines.push(format!("  Version: {version}"));
        }
        if !result.metadata.build.is_empty() {
            lines.push(format!("  Build: {}", result.metadata.build.join(" ")));
        }
        if let Some(tools) = &result.metadata.tools {
            lines.push(format!("  Tools: {tools}"));
        }
        if result.restarts > 0 {
            lines.push(format!("  Restarts: {}", result.restarts));
        }
        if self.mode.includes_output(result.outcome) {
            lines.extend(result.output.iter().map(|line| line.to_string()));
        }
        self.log.output_block(lines.iter().map(String::as_str));
    }

    /// Marks the run as interrupted.
    pub fn set_interrupted(&self) {
        lock(&self.inner).interrupted = true;
    }

    /// Returns the summary of the run so far.
    pub fn summary(&self) -> RunSummary {
        let inner = lock(&self.inner);
        RunSummary {
            total: self.total,
            counts: inner.counts,
            non_passing: inner.non_passing.clone(),
            interrupted: inner.interrupted,
            start_time: self.start_time,
            elapsed: self.started_at.elapsed(),
        }
    }

    /// Writes the summary: counts per outcome, then non-passing tests grouped by outcome.
    pub fn write_summary(&self) -> RunSummary {
        let summary = self.summary();
        self.log
            .notice_with(|styles| render_summary_line(&summary, styles));
        self.log.notice(&format!(
            "{:>12} {}",
            "Started",
            summary.start_time.format("%Y-%m-%d %H:%M:%S %:z")
        ));

        for outcome in Outcome::ALL {
            if outcome == Outcome::Passed || summary.counts.get(outcome) == 0 {
                continue;
            }
            self.log.notice_with(|styles| {
                format!(
                    "{}:",
                    capitalize(outcome.as_str()).style(outcome.style(styles))
                )
            });
            for (_, name) in summary
                .non_passing
                .iter()
                .filter(|(o, _)| *o == outcome)
            {
                self.log
                    .notice_with(|styles| format!("  {}", name.style(styles.name)));
            }
        }
        summary
    }

    fn progress_line(&self, index: usize, counts: &OutcomeCounts, exe: &Utf8Path) -> String {
        let width = self.total.to_string().len();
        let mut line = format!("[{index:>width$}/{total:>width$}]", total = self.total);
        for outcome in Outcome::ALL {
            swrite!(
                line,
                " {}:{:<width$}",
                outcome.tag(),
                counts.get(outcome)
            );
        }
        swrite!(line, " | {}/{}: {}", self.arch, self.bsp, test_name(exe));
        line
    }

    fn result_line(&self, result: &TestResult) -> String {
        let width = self.total.to_string().len();
        let mut line = format!(
            "Result: {:<13} Time: {:>8.3}s [{:>width$}/{:>width$}] {}",
            result.outcome.as_str(),
            result.duration.as_secs_f64(),
            result.index,
            self.total,
            result.name(),
        );
        if let Some(label) = &result.label {
            swrite!(line, " ({label})");
        }
        line
    }
}

fn render_summary_line(summary: &RunSummary, styles: &Styles) -> String {
    let heading_style = if summary.is_success() {
        styles.pass
    } else {
        styles.fail
    };
    let mut line = format!("{:>12} ", "Summary".style(heading_style));
    swrite!(line, "[{:>8.3}s] ", summary.elapsed.as_secs_f64());
    swrite!(
        line,
        "{}",
        plural(summary.finished(), "test", "tests").style(styles.count)
    );
    if summary.finished() != summary.total {
        swrite!(line, " of {}", summary.total.style(styles.count));
    }
    line.push_str(" run:");

    let mut first = true;
    for outcome in Outcome::ALL {
        let count = summary.counts.get(outcome);
        if count == 0 && outcome != Outcome::Passed {
            continue;
        }
        line.push_str(if first { " " } else { ", " });
        first = false;
        swrite!(
            line,
            "{} {}",
            count.style(styles.count),
            outcome.as_str().style(outcome.style(styles))
        );
    }
    if summary.interrupted {
        swrite!(line, " ({})", "interrupted".style(styles.fail));
    }
    line
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureSource;
    use pretty_assertions::assert_eq;

    fn result(index: usize, exe: &str, outcome: Outcome) -> TestResult {
        let mut output = CaptureBuffer::new();
        output.push(CaptureSource::Target, "*** BEGIN OF TEST X ***");
        TestResult {
            index,
            exe: exe.into(),
            outcome,
            label: Some("X".to_owned()),
            metadata: TestMetadata::default(),
            restarts: 0,
            duration: Duration::from_millis(1500),
            output,
        }
    }

    #[test]
    fn progress_line_format() {
        let log = Arc::new(RunLog::buffer(false));
        let report = Report::new(log.clone(), "sparc", "erc32", 12, ReportMode::None);
        report.finish(result(1, "a.exe", Outcome::Passed));
        report.finish(result(2, "b.exe", Outcome::Timeout));
        report.start(3, Utf8Path::new("testsuites/ticker.exe"));
        let terminal = log.terminal_contents();
        assert_eq!(
            terminal,
            "[ 3/12] p:1  f:0  u:0  e:0  I:0  B:0  t:1  i:0  | sparc/erc32: ticker.exe\n"
        );
    }

    #[test]
    fn report_mode_selects_output() {
        let log = Arc::new(RunLog::buffer(false));
        let report = Report::new(log.clone(), "arm", "xilinx_zynq_a9_qemu", 2, ReportMode::Failures);
        report.finish(result(1, "hello.exe", Outcome::Passed));
        report.finish(result(2, "ticker.exe", Outcome::Failed));
        let file = log.file_contents();
        let begin_lines = file
            .lines()
            .filter(|line| *line == "] *** BEGIN OF TEST X ***")
            .count();
        assert_eq!(begin_lines, 1, "only the failed test has output:\n{file}");
        assert!(file.contains("Result: passed"));
        assert!(file.contains("Result: failed"));
    }

    #[test]
    fn summary_counts_and_success() {
        let log = Arc::new(RunLog::buffer(false));
        let report = Report::new(log.clone(), "arm", "raspberrypi", 3, ReportMode::None);
        report.finish(result(1, "a.exe", Outcome::Passed));
        report.finish(result(2, "b.exe", Outcome::Benchmark));
        let summary = report.summary();
        assert!(summary.is_success(), "benchmarks don't fail a run");
        assert_eq!(summary.finished(), 2);

        report.finish(result(3, "c.exe", Outcome::Invalid));
        let summary = report.write_summary();
        assert!(!summary.is_success());
        assert_eq!(summary.counts.total(), summary.total);
        assert_eq!(
            summary.non_passing,
            vec![
                (Outcome::Benchmark, "b.exe".to_owned()),
                (Outcome::Invalid, "c.exe".to_owned())
            ]
        );

        let terminal = log.terminal_contents();
        assert!(
            terminal.contains("3 tests run: 1 passed, 1 benchmark, 1 invalid"),
            "{terminal}"
        );
        assert!(terminal.contains("Invalid:\n  c.exe\n"), "{terminal}");
        assert!(terminal.contains("     Started 20"), "{terminal}");
    }

    #[test]
    fn interrupted_run_is_not_successful() {
        let report = Report::new(
            Arc::new(RunLog::buffer(false)),
            "arm",
            "raspberrypi",
            1,
            ReportMode::All,
        );
        report.set_interrupted();
        assert!(!report.summary().is_success());
    }

    #[test]
    fn report_mode_parse() {
        assert_eq!("all".parse::<ReportMode>().ok(), Some(ReportMode::All));
        assert!("some".parse::<ReportMode>().is_err());
    }
}
