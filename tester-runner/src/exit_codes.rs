// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `rtems-tester` failures.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum TesterExitCode {}

impl TesterExitCode {
    /// Every test passed, or was a benchmark, expected failure, indeterminate or user-input test.
    pub const OK: i32 = 0;

    /// No test executables were found, but no other errors occurred.
    pub const NO_TESTS: i32 = 4;

    /// One or more tests failed, timed out or were invalid.
    pub const TEST_RUN_FAILED: i32 = 100;

    /// A user issue happened while setting up a run, for example a missing test path or log
    /// file.
    pub const SETUP_ERROR: i32 = 96;

    /// The tester configuration could not be read or is invalid.
    pub const CONFIG_ERROR: i32 = 97;

    /// The run was interrupted with Ctrl-C.
    ///
    /// 128 plus the number of `SIGINT`.
    pub const INTERRUPTED: i32 = 130;
}
