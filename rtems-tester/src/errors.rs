// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING, StderrStyles};
use camino::Utf8PathBuf;
use owo_colors::OwoColorize;
use rtems_tester_runner::{errors::*, exit_codes::TesterExitCode};
use std::error::Error;
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// The #[error()] strings are placeholders: errors are printed with display_to_stderr, which
// colorizes them and walks the source chain.

/// An error the tester knows how to report, each with a documented exit code.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("config read error")]
    ConfigReadError {
        #[from]
        err: ConfigReadError,
    },
    #[error("config value error")]
    ConfigValueError {
        #[from]
        err: ConfigValueError,
    },
    #[error("test discovery error")]
    TestDiscoveryError {
        #[from]
        err: TestDiscoveryError,
    },
    #[error("no tests found")]
    NoTests { paths: Vec<Utf8PathBuf> },
    #[error("run log error")]
    RunLogError {
        #[from]
        err: RunLogError,
    },
    #[error("signal handler setup error")]
    SignalHandlerSetupError {
        #[from]
        err: SignalHandlerSetupError,
    },
    #[error("test run failed")]
    TestRunFailed { failures: usize },
    #[error("test run interrupted")]
    TestRunInterrupted,
}

impl ExpectedError {
    /// Returns the exit code the process should exit with.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::ConfigReadError { .. } | Self::ConfigValueError { .. } => {
                TesterExitCode::CONFIG_ERROR
            }
            Self::TestDiscoveryError { .. }
            | Self::RunLogError { .. }
            | Self::SignalHandlerSetupError { .. } => TesterExitCode::SETUP_ERROR,
            Self::NoTests { .. } => TesterExitCode::NO_TESTS,
            Self::TestRunFailed { .. } => TesterExitCode::TEST_RUN_FAILED,
            Self::TestRunInterrupted => TesterExitCode::INTERRUPTED,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match self {
            Self::ConfigReadError { err } => {
                error!("failed to read tester configuration");
                Some(err as &dyn Error)
            }
            Self::ConfigValueError { err } => {
                error!("invalid tester configuration");
                Some(err as &dyn Error)
            }
            Self::TestDiscoveryError { err } => {
                error!("failed to find test executables");
                Some(err as &dyn Error)
            }
            Self::NoTests { paths } => {
                let paths: Vec<_> = paths.iter().map(|path| path.as_str()).collect();
                error!(
                    "no test executables found in `{}`",
                    paths.join("`, `").style(styles.bold)
                );
                None
            }
            Self::RunLogError { err } => {
                error!("failed to set up the run log");
                Some(err as &dyn Error)
            }
            Self::SignalHandlerSetupError { err } => {
                error!("error setting up signal handler");
                Some(err as &dyn Error)
            }
            Self::TestRunFailed { failures } => {
                error!(
                    "test run failed: {} {} failed, timed out or were invalid",
                    failures.style(styles.bold),
                    if *failures == 1 { "test" } else { "tests" },
                );
                None
            }
            Self::TestRunInterrupted => {
                error!("test run interrupted");
                None
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}
