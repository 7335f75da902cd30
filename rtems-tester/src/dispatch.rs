// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::{ExpectedError, Result},
    output::{CLAP_STYLES, OutputContext, OutputOpts},
};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use rtems_tester_runner::{
    config::{ResolvedConfig, TesterSettings},
    exit_codes::TesterExitCode,
    log::RunLog,
    report::{Report, ReportMode},
    scheduler::{Scheduler, SessionExecutor},
    signal::SignalHandler,
    test_list::TestList,
};
use std::{fmt::Write as _, sync::Arc};
use tracing::{info, warn};

/// Runs RTEMS test executables on simulators and boards.
///
/// Each executable is run through the directive script of the selected board
/// support package. Its console output is classified from the banners the RTEMS
/// test suite prints, and a summary is written once every test has finished.
#[derive(Debug, Parser)]
#[command(version, name = "rtems-tester", styles = CLAP_STYLES)]
pub struct TesterApp {
    #[command(flatten)]
    output: OutputOpts,

    #[command(subcommand)]
    command: Command,
}

impl TesterApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, returning the process exit code on success.
    pub fn exec(self, output: OutputContext) -> Result<i32> {
        match self.command {
            Command::Run(opts) => opts.exec(output),
            Command::List { paths } => {
                let tests = discover(&paths)?;
                for test in tests.iter() {
                    println!("{:>4} {}", test.index, test.exe);
                }
                Ok(TesterExitCode::OK)
            }
            Command::ShowConfig { config_opts } => {
                let config = config_opts.make_config()?;
                print!("{}", render_config(&config));
                Ok(TesterExitCode::OK)
            }
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run test executables
    ///
    /// Directories are searched recursively for `*.exe` files. Up to `--jobs`
    /// tests run at once; results are reported in the order the executables
    /// were given.
    Run(RunOpts),

    /// List the test executables a run would use, without running them
    List {
        /// Test executables, or directories to search for them
        #[arg(required = true, value_name = "PATHS")]
        paths: Vec<Utf8PathBuf>,
    },

    /// Show the resolved configuration for a board
    ShowConfig {
        #[command(flatten)]
        config_opts: ConfigOpts,
    },
}

#[derive(Debug, Args)]
struct ConfigOpts {
    /// Tester configuration file, layered over the built-in defaults
    #[arg(long, value_name = "PATH", env = "RTEMS_TESTER_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Board support package whose `[bsp.<name>]` section is applied
    #[arg(long, value_name = "NAME")]
    bsp: Option<String>,
}

impl ConfigOpts {
    fn make_config(&self) -> Result<ResolvedConfig> {
        Ok(ResolvedConfig::from_sources(
            self.config.as_deref(),
            self.bsp.as_deref(),
        )?)
    }
}

#[derive(Debug, Args)]
struct RunOpts {
    #[command(flatten)]
    config_opts: ConfigOpts,

    /// Number of tests to run at once [default: number of CPUs]
    #[arg(long, short = 'j', value_name = "N")]
    jobs: Option<usize>,

    /// Write the run log to this file as well as the terminal
    #[arg(long, value_name = "PATH")]
    log: Option<Utf8PathBuf>,

    /// How much captured output the log gets per test: all, failures, none
    #[arg(long, value_name = "MODE")]
    report_mode: Option<ReportMode>,

    /// Seconds without console output before a test times out
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Absolute number of seconds a single test may run
    #[arg(long, value_name = "SECS")]
    max_test_period: Option<u64>,

    /// Test executables, or directories to search for them
    #[arg(required = true, value_name = "PATHS")]
    paths: Vec<Utf8PathBuf>,
}

impl RunOpts {
    fn exec(self, output: OutputContext) -> Result<i32> {
        let mut config = self.config_opts.make_config()?;
        self.apply_overrides(&mut config);
        let settings = Arc::new(TesterSettings::from_config(&config)?);

        let tests = discover(&self.paths)?;

        let mut log = RunLog::new(self.log.as_deref(), output.verbose)?;
        if output.colorize_stdout() {
            log.colorize();
        }
        let log = Arc::new(log);
        let handler = SignalHandler::new()?;

        info!(
            arch = %settings.arch,
            bsp = %settings.bsp,
            tests = tests.len(),
            jobs = settings.jobs,
            "starting test run"
        );
        let report = Report::new(
            log.clone(),
            settings.arch.clone(),
            settings.bsp.clone(),
            tests.len(),
            settings.report_mode,
        );
        let executor = SessionExecutor::new(settings.clone());
        let summary = Scheduler::new(&report, settings.jobs, handler).run(&tests, &executor);

        if let Err(err) = log.flush() {
            warn!(%err, "failed to flush the run log");
        }

        if summary.interrupted {
            Err(ExpectedError::TestRunInterrupted)
        } else if !summary.is_success() {
            Err(ExpectedError::TestRunFailed {
                failures: summary.counts.failures(),
            })
        } else {
            Ok(TesterExitCode::OK)
        }
    }

    fn apply_overrides(&self, config: &mut ResolvedConfig) {
        if let Some(jobs) = self.jobs {
            config.insert("jobs", jobs.to_string());
        }
        if let Some(mode) = self.report_mode {
            config.insert("report_mode", mode.to_string());
        }
        if let Some(timeout) = self.timeout {
            config.insert("timeout", timeout.to_string());
        }
        if let Some(max) = self.max_test_period {
            config.insert("max_test_period", max.to_string());
        }
    }
}

fn discover(paths: &[Utf8PathBuf]) -> Result<TestList> {
    let tests = TestList::discover(paths)?;
    if tests.is_empty() {
        return Err(ExpectedError::NoTests {
            paths: paths.to_vec(),
        });
    }
    Ok(tests)
}

/// Renders a resolved config one key per line. List values continue on indented lines.
fn render_config(config: &ResolvedConfig) -> String {
    let mut out = String::new();
    for (key, value) in config.iter() {
        let mut lines = value.lines();
        let first = lines.next().unwrap_or_default();
        let _ = writeln!(out, "{key} = {first}");
        for line in lines {
            let _ = writeln!(out, "    {line}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{CommandFactory, error::ErrorKind};
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn verify_app() {
        TesterApp::command().debug_assert();
    }

    #[test]
    fn argument_parsing() {
        let valid: &[&str] = &[
            "rtems-tester run hello.exe",
            "rtems-tester run --bsp erc32 --config tester.toml build/",
            "rtems-tester run -j 4 --log run.log a.exe b.exe",
            "rtems-tester run --report-mode all --timeout 30 --max-test-period 600 a.exe",
            "rtems-tester --color never -v run a.exe",
            "rtems-tester list build/",
            "rtems-tester show-config --bsp erc32",
        ];
        for args in valid {
            let args = shell_words::split(args).expect("valid command line");
            if let Err(error) = TesterApp::try_parse_from(&args) {
                panic!("{args:?} should have parsed, but didn't: {error}");
            }
        }

        let invalid: &[(&str, ErrorKind)] = &[
            ("rtems-tester run", ErrorKind::MissingRequiredArgument),
            ("rtems-tester run --report-mode some a.exe", ErrorKind::ValueValidation),
            ("rtems-tester run -j many a.exe", ErrorKind::ValueValidation),
            ("rtems-tester list", ErrorKind::MissingRequiredArgument),
        ];
        for (args, kind) in invalid {
            let args = shell_words::split(args).expect("valid command line");
            match TesterApp::try_parse_from(&args) {
                Ok(_) => panic!("{args:?} should have failed to parse"),
                Err(error) => assert_eq!(error.kind(), *kind, "for {args:?}"),
            }
        }
    }

    #[test]
    fn overrides_win_over_config() {
        let app = TesterApp::try_parse_from([
            "rtems-tester",
            "run",
            "-j",
            "3",
            "--report-mode",
            "none",
            "--timeout",
            "7",
            "a.exe",
        ])
        .expect("parsed");
        let Command::Run(opts) = app.command else {
            panic!("expected the run command");
        };
        let mut config = ResolvedConfig::from_pairs([
            ("jobs", "1"),
            ("report_mode", "all"),
            ("timeout", "180"),
        ]);
        opts.apply_overrides(&mut config);
        assert_eq!(config.get("jobs"), Some("3"));
        assert_eq!(config.get("report_mode"), Some("none"));
        assert_eq!(config.get("timeout"), Some("7"));
    }

    #[test]
    fn renders_lists_indented() {
        let config = ResolvedConfig::from_pairs([
            ("arch", "sparc"),
            ("script", "console stdio\nexecute sparc-rtems6-sis @EXE@"),
        ]);
        assert_eq!(
            render_config(&config),
            indoc! {"
                arch = sparc
                script = console stdio
                    execute sparc-rtems6-sis @EXE@
            "}
        );
    }
}
