// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Terminal output: color choice, help styles and the diagnostic log on stderr.
//!
//! Diagnostics from the engine carry the test they concern as `index` and `exe` fields. The
//! formatter here puts those up front, so a warning reads `warning: [3] ticker.exe: ...` in the
//! middle of a parallel run.

use clap::{
    Args, ValueEnum,
    builder::{
        Styles,
        styling::{AnsiColor, Effects},
    },
};
use owo_colors::{OwoColorize, Style, style};
use rtems_tester_runner::report::Outcome;
use std::fmt::{self, Write as _};
use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
    level_filters::LevelFilter,
};
use tracing_subscriber::{
    Layer,
    filter::{ParseError, Targets},
    fmt::{FmtContext, FormatEvent, FormatFields, format},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// Environment variable holding the diagnostic log filter, in `Targets` syntax.
pub(crate) const LOG_ENV: &str = "RTEMS_TESTER_LOG";

/// Events with this target are printed without a level heading.
pub(crate) const NO_HEADING: &str = "rtems_tester::no_heading";

pub(crate) const CLAP_STYLES: Styles = Styles::styled()
    .header(AnsiColor::Yellow.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Yellow.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Green.on_default())
    .error(AnsiColor::Red.on_default().effects(Effects::BOLD))
    .invalid(AnsiColor::Yellow.on_default().effects(Effects::BOLD));

#[derive(Copy, Clone, Debug, Args)]
#[must_use]
pub(crate) struct OutputOpts {
    /// Print captured target output and engine diagnostics to the terminal
    #[arg(long, short, global = true, env = "RTEMS_TESTER_VERBOSE")]
    pub(crate) verbose: bool,

    /// Produce color output: auto, always, never
    #[arg(
        long,
        value_enum,
        default_value_t,
        hide_possible_values = true,
        global = true,
        value_name = "WHEN",
        env = "RTEMS_TESTER_COLOR"
    )]
    pub(crate) color: Color,
}

impl OutputOpts {
    pub(crate) fn init(self) -> OutputContext {
        let env_filter = std::env::var(LOG_ENV).unwrap_or_default();
        let (targets, parse_error) = log_filter(self.verbose, &env_filter);
        let styles = if self.color.enabled_for(supports_color::Stream::Stderr) {
            LogStyles::colorized()
        } else {
            LogStyles::default()
        };

        let layer = tracing_subscriber::fmt::layer()
            .event_format(DiagnosticFormatter { styles })
            .with_writer(std::io::stderr)
            .with_filter(targets);
        // Only the first call installs a subscriber.
        if tracing_subscriber::registry().with(layer).try_init().is_ok()
            && let Some(err) = parse_error
        {
            tracing::warn!("ignoring invalid {LOG_ENV} value `{env_filter}`: {err}");
        }

        OutputContext {
            verbose: self.verbose,
            color: self.color,
        }
    }
}

/// The diagnostic filter: `RTEMS_TESTER_LOG` if it is set and valid, otherwise the front end at
/// info and the engine at warn, or at info too when verbose.
fn log_filter(verbose: bool, env_filter: &str) -> (Targets, Option<ParseError>) {
    let engine = if verbose {
        LevelFilter::INFO
    } else {
        LevelFilter::WARN
    };
    let default = Targets::new()
        .with_target("rtems_tester", LevelFilter::INFO)
        .with_target("rtems_tester_runner", engine)
        .with_default(LevelFilter::WARN);

    if env_filter.trim().is_empty() {
        return (default, None);
    }
    match env_filter.parse::<Targets>() {
        Ok(targets) => (targets, None),
        Err(err) => (default, Some(err)),
    }
}

/// How the process writes to the terminal.
#[derive(Copy, Clone, Debug)]
#[must_use]
pub struct OutputContext {
    pub(crate) verbose: bool,
    pub(crate) color: Color,
}

impl OutputContext {
    /// Returns general stderr styles for the current output context.
    pub fn stderr_styles(&self) -> StderrStyles {
        if self.color.enabled_for(supports_color::Stream::Stderr) {
            StderrStyles {
                bold: style().bold(),
            }
        } else {
            StderrStyles::default()
        }
    }

    /// Whether the run log's terminal output, on stdout, should be colored.
    pub(crate) fn colorize_stdout(&self) -> bool {
        self.color.enabled_for(supports_color::Stream::Stdout)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
#[must_use]
pub(crate) enum Color {
    #[default]
    Auto,
    Always,
    Never,
}

impl Color {
    fn enabled_for(self, stream: supports_color::Stream) -> bool {
        match self {
            Color::Auto => supports_color::on_cached(stream).is_some(),
            Color::Always => true,
            Color::Never => false,
        }
    }
}

/// Styles for errors printed to stderr.
#[derive(Debug, Default)]
pub struct StderrStyles {
    pub(crate) bold: Style,
}

#[derive(Debug, Default)]
struct LogStyles {
    error: Style,
    warning: Style,
    heading: Style,
    test: Style,
    passed: Style,
    failed: Style,
    other_outcome: Style,
    fields: Style,
}

impl LogStyles {
    fn colorized() -> Self {
        Self {
            error: style().red().bold(),
            warning: style().yellow().bold(),
            heading: style().bold(),
            test: style().cyan(),
            passed: style().green().bold(),
            failed: style().red().bold(),
            other_outcome: style().yellow().bold(),
            fields: style().dimmed(),
        }
    }

    fn outcome(&self, value: &str) -> Style {
        match Outcome::ALL.iter().find(|outcome| outcome.as_str() == value) {
            Some(Outcome::Passed) => self.passed,
            Some(outcome) if outcome.is_failure() => self.failed,
            _ => self.other_outcome,
        }
    }
}

/// The fields of one event, with the test it concerns pulled out.
#[derive(Debug, Default)]
struct EventFields {
    message: String,
    index: Option<String>,
    exe: Option<String>,
    outcome: Option<String>,
    rest: Vec<(&'static str, String)>,
}

impl EventFields {
    fn record(&mut self, name: &'static str, value: String) {
        match name {
            "message" => self.message = value,
            "index" => self.index = Some(value),
            "exe" => self.exe = Some(value),
            "outcome" => self.outcome = Some(value),
            _ => self.rest.push((name, value)),
        }
    }
}

impl Visit for EventFields {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record(field.name(), format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field.name(), value.to_owned());
    }
}

struct DiagnosticFormatter {
    styles: LogStyles,
}

impl<S, N> FormatEvent<S, N> for DiagnosticFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut fields = EventFields::default();
        event.record(&mut fields);
        let heading = (metadata.target() != NO_HEADING).then_some(*metadata.level());
        writeln!(writer, "{}", render_line(heading, &fields, &self.styles))
    }
}

fn render_line(heading: Option<Level>, fields: &EventFields, styles: &LogStyles) -> String {
    let mut line = String::new();
    if let Some(level) = heading {
        let (name, style) = match level {
            Level::ERROR => ("error", styles.error),
            Level::WARN => ("warning", styles.warning),
            Level::INFO => ("info", styles.heading),
            Level::DEBUG => ("debug", styles.heading),
            Level::TRACE => ("trace", styles.fields),
        };
        let _ = write!(line, "{}: ", name.style(style));
    }

    match (&fields.index, &fields.exe) {
        (Some(index), Some(exe)) => {
            let _ = write!(line, "[{index}] {}: ", exe.style(styles.test));
        }
        (Some(index), None) => {
            let _ = write!(line, "[{index}] ");
        }
        (None, Some(exe)) => {
            let _ = write!(line, "{}: ", exe.style(styles.test));
        }
        (None, None) => {}
    }

    line.push_str(&fields.message);
    if let Some(outcome) = &fields.outcome {
        let _ = write!(line, " ({})", outcome.style(styles.outcome(outcome)));
    }
    if !fields.rest.is_empty() {
        let rest = fields
            .rest
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = write!(line, " {}", rest.style(styles.fields));
    }
    line
}
