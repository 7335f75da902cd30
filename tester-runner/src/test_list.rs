// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The list of test executables to run.

use crate::errors::TestDiscoveryError;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// The file extension of RTEMS test executables.
pub const EXE_EXTENSION: &str = "exe";

/// One executable in a [`TestList`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestInstance {
    /// The 1-based position in the list.
    pub index: usize,

    /// The path to the executable, as given or as found.
    pub exe: Utf8PathBuf,
}

impl TestInstance {
    /// The file name of the executable.
    pub fn name(&self) -> &str {
        self.exe.file_name().unwrap_or(self.exe.as_str())
    }
}

/// An ordered list of test executables.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TestList {
    tests: Vec<TestInstance>,
}

impl TestList {
    /// Creates a list from executable paths, in the order given.
    pub fn new(exes: impl IntoIterator<Item = impl Into<Utf8PathBuf>>) -> Self {
        let tests = exes
            .into_iter()
            .enumerate()
            .map(|(idx, exe)| TestInstance {
                index: idx + 1,
                exe: exe.into(),
            })
            .collect();
        Self { tests }
    }

    /// Expands `paths` into executables.
    ///
    /// Files are kept in argument order. Directories are searched recursively for `*.exe` files,
    /// which are added in sorted order.
    pub fn discover(paths: &[Utf8PathBuf]) -> Result<Self, TestDiscoveryError> {
        let mut exes = Vec::new();
        for path in paths {
            if path.is_dir() {
                let before = exes.len();
                collect_dir(path, &mut exes)?;
                exes[before..].sort_unstable();
                debug!(%path, found = exes.len() - before, "searched directory");
            } else if path.exists() {
                exes.push(path.clone());
            } else {
                return Err(TestDiscoveryError::NotFound { path: path.clone() });
            }
        }
        Ok(Self::new(exes))
    }

    /// The number of tests.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// Returns true if there are no tests.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Iterates over the tests in order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &TestInstance> + '_ {
        self.tests.iter()
    }
}

impl IntoIterator for TestList {
    type Item = TestInstance;
    type IntoIter = std::vec::IntoIter<TestInstance>;

    fn into_iter(self) -> Self::IntoIter {
        self.tests.into_iter()
    }
}

fn collect_dir(dir: &Utf8Path, exes: &mut Vec<Utf8PathBuf>) -> Result<(), TestDiscoveryError> {
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|err| TestDiscoveryError::Walk {
            path: dir.to_owned(),
            err,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = Utf8PathBuf::from_path_buf(entry.into_path()).map_err(|path| {
            TestDiscoveryError::NonUtf8 {
                path: path.to_string_lossy().into_owned(),
            }
        })?;
        if path.extension() == Some(EXE_EXTENSION) {
            exes.push(path);
        }
    }
    Ok(())
}
