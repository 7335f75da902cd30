// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for rtems-tester.
//!
//! Board configuration is resolved outside of the tester into a flat [`ResolvedConfig`]: a
//! string-keyed mapping with helpers for booleans, numbers and lists. [`TesterSettings`] is the
//! typed view of it that the rest of the crate consumes, built once before any test starts so that
//! configuration errors fail fast.

use crate::{
    errors::{ConfigReadError, ConfigValueError},
    report::ReportMode,
    session::DirectiveScript,
};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use regex::Regex;
use std::{str::FromStr, time::Duration};
use toml::{Table, Value};

/// A resolved configuration mapping: key to string value.
///
/// Values are stored as strings. An empty value counts as unset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedConfig {
    values: IndexMap<String, String>,
}

impl ResolvedConfig {
    /// Contains the default config as a TOML file.
    ///
    /// The defaults included with this copy of rtems-tester are:
    ///
    /// ```toml
    #[doc = include_str!("../default-config.toml")]
    /// ```
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// The name of the table holding per-board sections.
    pub const BSP_TABLE: &'static str = "bsp";

    /// Creates an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mapping from key-value pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut config = Self::new();
        for (key, value) in pairs {
            config.insert(key, value);
        }
        config
    }

    /// Reads the default config, then the given file if any, then the section for `bsp` if any.
    ///
    /// If `bsp` is specified, the key `bsp` is set to its name unless the configuration sets it.
    pub fn from_sources(
        file: Option<&Utf8Path>,
        bsp: Option<&str>,
    ) -> Result<Self, ConfigReadError> {
        let mut config = Self::default_config();

        let user = match file {
            Some(file) => {
                let data = std::fs::read_to_string(file).map_err(|err| ConfigReadError::Read {
                    path: file.to_owned(),
                    err,
                })?;
                Some((file.to_owned(), data))
            }
            None => None,
        };

        match &user {
            Some((path, data)) => config.layer_toml(path, data, bsp)?,
            None => {
                if let Some(bsp) = bsp {
                    return Err(ConfigReadError::BspNotFound {
                        bsp: bsp.to_owned(),
                        known: Vec::new(),
                    });
                }
            }
        }

        if let Some(bsp) = bsp {
            if config.get("bsp").is_none() {
                config.insert("bsp", bsp);
            }
        }

        Ok(config)
    }

    /// Parses `data` as TOML and layers it on top of this mapping.
    ///
    /// `path` is only used for error messages.
    pub fn layer_toml(
        &mut self,
        path: &Utf8Path,
        data: &str,
        bsp: Option<&str>,
    ) -> Result<(), ConfigReadError> {
        let table: Table = toml::from_str(data).map_err(|err| ConfigReadError::Toml {
            path: path.to_owned(),
            err,
        })?;

        let mut bsp_tables = None;
        for (key, value) in &table {
            if key == Self::BSP_TABLE {
                if let Value::Table(bsps) = value {
                    bsp_tables = Some(bsps);
                    continue;
                }
            }
            self.layer_value(path, key, value)?;
        }

        if let Some(bsp) = bsp {
            let section = bsp_tables
                .and_then(|bsps| bsps.get(bsp))
                .and_then(|section| section.as_table());
            match section {
                Some(section) => {
                    for (key, value) in section {
                        self.layer_value(path, key, value)?;
                    }
                }
                None => {
                    let mut known: Vec<_> = bsp_tables
                        .map(|bsps| bsps.keys().cloned().collect())
                        .unwrap_or_default();
                    known.sort_unstable();
                    return Err(ConfigReadError::BspNotFound {
                        bsp: bsp.to_owned(),
                        known,
                    });
                }
            }
        }

        Ok(())
    }

    /// Sets a value, replacing any previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Returns the value for `key`, or `None` if it is unset or empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|value| value.as_str())
            .filter(|value| !value.trim().is_empty())
    }

    /// Returns true if `key` has a non-empty value.
    pub fn is_defined(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Returns the value for `key`, or an error if it is unset.
    pub fn require(&self, key: &str) -> Result<&str, ConfigValueError> {
        self.get(key).ok_or_else(|| ConfigValueError::MissingKey {
            key: key.to_owned(),
        })
    }

    /// Returns the value for `key` as a boolean.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigValueError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigValueError::InvalidBool {
                key: key.to_owned(),
                value: value.to_owned(),
            }),
        }
    }

    /// Returns the value for `key` as an unsigned integer.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, ConfigValueError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| ConfigValueError::InvalidNumber {
                key: key.to_owned(),
                value: value.to_owned(),
                err,
            })
    }

    /// Returns the value for `key` as a number of seconds.
    pub fn get_seconds(&self, key: &str) -> Result<Option<Duration>, ConfigValueError> {
        Ok(self.get_u64(key)?.map(Duration::from_secs))
    }

    /// Returns the value for `key` split into lines. Lines are trimmed and empty lines dropped.
    pub fn get_list(&self, key: &str) -> Vec<&str> {
        self.get(key)
            .map(|value| {
                value
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Compiles the value for `key` as a regular expression.
    pub fn get_regex(&self, key: &str) -> Result<Option<Regex>, ConfigValueError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        Regex::new(value)
            .map(Some)
            .map_err(|err| ConfigValueError::InvalidRegex {
                key: key.to_owned(),
                err,
            })
    }

    /// Returns the value for `key` with placeholders substituted.
    pub fn expand(&self, key: &str, placeholders: &Placeholders<'_>) -> Option<String> {
        self.get(key).map(|value| placeholders.expand(value))
    }

    /// Iterates over all keys and values, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    // ---
    // Helper methods
    // ---

    fn default_config() -> Self {
        let mut config = Self::new();
        config
            .layer_toml(Utf8Path::new("<default config>"), Self::DEFAULT_CONFIG, None)
            .unwrap_or_else(|err| panic!("default config should be valid: {err}"));
        config
    }

    fn layer_value(
        &mut self,
        path: &Utf8Path,
        key: &str,
        value: &Value,
    ) -> Result<(), ConfigReadError> {
        let unsupported = |value: &Value| ConfigReadError::UnsupportedValue {
            path: path.to_owned(),
            key: key.to_owned(),
            kind: value.type_str(),
        };

        let rendered = match value {
            Value::Array(items) => {
                let mut lines = Vec::with_capacity(items.len());
                for item in items {
                    lines.push(scalar_to_string(item).ok_or_else(|| unsupported(item))?);
                }
                lines.join("\n")
            }
            other => scalar_to_string(other).ok_or_else(|| unsupported(other))?,
        };
        self.insert(key, rendered);
        Ok(())
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        Value::Datetime(d) => Some(d.to_string()),
        Value::Array(_) | Value::Table(_) => None,
    }
}

/// Values substituted for the `@ARCH@`, `@BSP@`, `@EXE@` and `@FEXE@` placeholders.
#[derive(Clone, Copy, Debug)]
pub struct Placeholders<'a> {
    /// The target architecture.
    pub arch: &'a str,

    /// The board support package name.
    pub bsp: &'a str,

    /// The executable path as given.
    pub exe: &'a Utf8Path,

    /// The absolute path of the executable.
    pub full_exe: &'a Utf8Path,
}

impl Placeholders<'_> {
    /// Substitutes all placeholders in `text`.
    pub fn expand(&self, text: &str) -> String {
        // @FEXE@ first: @EXE@ is a suffix of it.
        text.replace("@FEXE@", self.full_exe.as_str())
            .replace("@EXE@", self.exe.as_str())
            .replace("@ARCH@", self.arch)
            .replace("@BSP@", self.bsp)
    }
}

/// The idle and absolute timeouts for one test.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timeouts {
    /// How long the target may go without printing anything.
    pub idle: Duration,

    /// How long a test may run in total.
    pub max: Duration,
}

/// Shell commands run around tests. Each may contain placeholders.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TargetCommandTemplates {
    /// Powers the target on, before the first test of a batch.
    pub on: Option<String>,

    /// Powers the target off, after the last test of a batch.
    pub off: Option<String>,

    /// Runs before every test.
    pub pretest: Option<String>,

    /// Runs after every test.
    pub posttest: Option<String>,

    /// Resets the target when the reset pattern is seen.
    pub reset: Option<String>,
}

/// Settings for the network-boot backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TftpSettings {
    /// The UDP port the server listens on.
    pub port: u16,

    /// How many times a block is resent before a session is abandoned.
    pub resend_limit: u32,

    /// How long to wait for an acknowledgement when the client doesn't negotiate a timeout.
    pub timeout: Duration,
}

/// Settings for the debugger backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GdbSettings {
    /// Commands sent to the debugger, one per prompt.
    pub script: Vec<String>,

    /// How long the debugger gets to quit before it is killed.
    pub quit_grace: Duration,
}

/// The typed tester settings derived from a [`ResolvedConfig`].
#[derive(Clone, Debug)]
pub struct TesterSettings {
    /// The target architecture.
    pub arch: String,

    /// The board support package.
    pub bsp: String,

    /// Idle and absolute timeouts.
    pub timeouts: Timeouts,

    /// How many times the target may restart before a test starts.
    pub max_restarts: u32,

    /// Matches the target's boot banner.
    pub target_start_regex: Option<Regex>,

    /// Matches output that requires the target to be reset.
    pub target_reset_regex: Option<Regex>,

    /// Shell commands run around tests.
    pub commands: TargetCommandTemplates,

    /// The directive script, unexpanded.
    pub script: DirectiveScript,

    /// Network-boot settings.
    pub tftp: TftpSettings,

    /// Debugger settings.
    pub gdb: GdbSettings,

    /// The number of tests to run at once.
    pub jobs: usize,

    /// How much output the log gets per test.
    pub report_mode: ReportMode,
}

impl TesterSettings {
    /// Builds the settings from a resolved configuration, validating everything.
    pub fn from_config(config: &ResolvedConfig) -> Result<Self, ConfigValueError> {
        let timeouts = Timeouts {
            idle: config
                .get_seconds("timeout")?
                .ok_or_else(|| missing("timeout"))?,
            max: config
                .get_seconds("max_test_period")?
                .ok_or_else(|| missing("max_test_period"))?,
        };

        let script_lines = config.get_list("script");
        let script = DirectiveScript::parse(&script_lines)?;

        let gdb_script: Vec<String> = config
            .get_list("gdb_script")
            .into_iter()
            .map(str::to_owned)
            .collect();
        if script.has_gdb() && gdb_script.is_empty() {
            return Err(missing("gdb_script"));
        }

        let report_mode = match config.get("report_mode") {
            Some(mode) => {
                ReportMode::from_str(mode).map_err(|_| ConfigValueError::InvalidChoice {
                    key: "report_mode".to_owned(),
                    value: mode.to_owned(),
                    known: ReportMode::variants(),
                })?
            }
            None => ReportMode::default(),
        };

        let jobs = match config.get_u64("jobs")? {
            Some(0) | None => num_cpus::get(),
            Some(jobs) => usize::try_from(jobs).unwrap_or(usize::MAX),
        };

        Ok(Self {
            arch: config.require("arch")?.to_owned(),
            bsp: config.require("bsp")?.to_owned(),
            timeouts,
            max_restarts: u32_setting(config, "max_restarts", 3)?,
            target_start_regex: config.get_regex("target_start_regex")?,
            target_reset_regex: config.get_regex("target_reset_regex")?,
            commands: TargetCommandTemplates {
                on: owned(config.get("target_on_command")),
                off: owned(config.get("target_off_command")),
                pretest: owned(config.get("target_pretest_command")),
                posttest: owned(config.get("target_posttest_command")),
                reset: owned(config.get("target_reset_command")),
            },
            script,
            tftp: TftpSettings {
                port: u16::try_from(u32_setting(config, "tftp_port", 69)?).map_err(|_| {
                    ConfigValueError::InvalidChoice {
                        key: "tftp_port".to_owned(),
                        value: config.get("tftp_port").unwrap_or_default().to_owned(),
                        known: &["0..=65535"],
                    }
                })?,
                resend_limit: u32_setting(config, "tftp_resend_limit", 5)?,
                timeout: config
                    .get_seconds("tftp_timeout")?
                    .unwrap_or(Duration::from_secs(5)),
            },
            gdb: GdbSettings {
                script: gdb_script,
                quit_grace: config
                    .get_seconds("gdb_quit_grace")?
                    .unwrap_or(Duration::from_secs(3)),
            },
            jobs,
            report_mode,
        })
    }

    /// Returns the placeholders for an executable under these settings.
    pub fn placeholders<'a>(&'a self, exe: &'a Utf8Path, full_exe: &'a Utf8Path) -> Placeholders<'a> {
        Placeholders {
            arch: &self.arch,
            bsp: &self.bsp,
            exe,
            full_exe,
        }
    }
}

/// Returns the absolute form of `path`, or `path` itself if the current directory is unknown.
pub(crate) fn absolute_path(path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        return path.to_owned();
    }
    match std::env::current_dir()
        .ok()
        .and_then(|cwd| Utf8PathBuf::from_path_buf(cwd).ok())
    {
        Some(cwd) => cwd.join(path),
        None => path.to_owned(),
    }
}

fn missing(key: &str) -> ConfigValueError {
    ConfigValueError::MissingKey {
        key: key.to_owned(),
    }
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(|value| value.trim().to_owned())
}

fn u32_setting(config: &ResolvedConfig, key: &str, default: u32) -> Result<u32, ConfigValueError> {
    match config.get_u64(key)? {
        Some(value) => Ok(u32::try_from(value).unwrap_or(u32::MAX)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Directive;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn config_from(data: &str, bsp: Option<&str>) -> Result<ResolvedConfig, ConfigReadError> {
        let mut config = ResolvedConfig::default_config();
        config.layer_toml(Utf8Path::new("test.toml"), data, bsp)?;
        Ok(config)
    }

    #[test]
    fn defaults_are_layered_under_user_values() {
        let config = config_from(
            indoc! {r#"
                arch = "sparc"
                timeout = 30
                script = ["console stdio", "execute sparc-rtems6-sis @EXE@"]

                [bsp.erc32]
                bsp = "erc32"
                max_restarts = 1
                target_start_regex = '^SIS - SPARC'

                [bsp.leon3]
                bsp = "leon3"
            "#},
            Some("erc32"),
        )
        .expect("config is valid");

        assert_eq!(config.get("arch"), Some("sparc"));
        assert_eq!(config.get("timeout"), Some("30"));
        // From the default config.
        assert_eq!(config.get("max_test_period"), Some("3000"));
        // From the BSP section.
        assert_eq!(config.get("max_restarts"), Some("1"));
        assert_eq!(
            config.get_list("script"),
            vec!["console stdio", "execute sparc-rtems6-sis @EXE@"]
        );

        let settings = TesterSettings::from_config(&config).expect("settings are valid");
        assert_eq!(settings.bsp, "erc32");
        assert_eq!(settings.timeouts.idle, Duration::from_secs(30));
        assert_eq!(settings.timeouts.max, Duration::from_secs(3000));
        assert_eq!(settings.max_restarts, 1);
        assert!(
            settings
                .target_start_regex
                .as_ref()
                .is_some_and(|regex| regex.is_match("SIS - SPARC/RISCV instruction simulator"))
        );
        assert_eq!(settings.report_mode, ReportMode::Failures);
        assert!(matches!(
            settings.script.backend(),
            Directive::Execute { .. }
        ));
    }

    #[test]
    fn unknown_bsp() {
        let err = config_from("[bsp.erc32]\narch = \"sparc\"\n", Some("pc386"))
            .expect_err("pc386 is not configured");
        match err {
            ConfigReadError::BspNotFound { bsp, known } => {
                assert_eq!(bsp, "pc386");
                assert_eq!(known, vec!["erc32".to_owned()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn nested_tables_are_rejected() {
        let err = config_from("[commands]\non = \"power on\"\n", None)
            .expect_err("only the bsp table may be nested");
        assert!(
            matches!(err, ConfigReadError::UnsupportedValue { ref key, kind: "table", .. } if key == "commands"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn empty_value_unsets() {
        let config = ResolvedConfig::from_pairs([("timeout", "  "), ("arch", "arm")]);
        assert_eq!(config.get("timeout"), None);
        assert!(!config.is_defined("timeout"));
        assert!(config.is_defined("arch"));
    }

    #[test_case("1", Some(true) ; "one")]
    #[test_case("Yes", Some(true) ; "yes")]
    #[test_case("false", Some(false) ; "false")]
    #[test_case("off", Some(false) ; "off")]
    fn bool_values(value: &str, expected: Option<bool>) {
        let config = ResolvedConfig::from_pairs([("flag", value)]);
        assert_eq!(config.get_bool("flag").expect("valid bool"), expected);
    }

    #[test]
    fn invalid_values_fail_fast() {
        let config = ResolvedConfig::from_pairs([
            ("flag", "maybe"),
            ("timeout", "ten"),
            ("target_start_regex", "(unclosed"),
        ]);
        assert!(matches!(
            config.get_bool("flag"),
            Err(ConfigValueError::InvalidBool { .. })
        ));
        assert!(matches!(
            config.get_u64("timeout"),
            Err(ConfigValueError::InvalidNumber { .. })
        ));
        assert!(matches!(
            config.get_regex("target_start_regex"),
            Err(ConfigValueError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn settings_require_script_and_target() {
        let mut config = ResolvedConfig::default_config();
        config.insert("arch", "arm");
        config.insert("bsp", "xilinx_zynq_a9_qemu");
        let err = TesterSettings::from_config(&config).expect_err("no script");
        assert!(matches!(
            err,
            ConfigValueError::Directive(crate::errors::DirectiveParseError::NoBackend)
        ));

        config.insert("script", "gdb arm-rtems6-gdb");
        let err = TesterSettings::from_config(&config).expect_err("gdb needs a gdb_script");
        assert!(
            matches!(err, ConfigValueError::MissingKey { ref key } if key == "gdb_script"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn placeholders() {
        let placeholders = Placeholders {
            arch: "arm",
            bsp: "raspberrypi",
            exe: Utf8Path::new("testsuites/hello.exe"),
            full_exe: Utf8Path::new("/build/testsuites/hello.exe"),
        };
        assert_eq!(
            placeholders.expand("power @ARCH@/@BSP@ load @EXE@ from @FEXE@"),
            "power arm/raspberrypi load testsuites/hello.exe from /build/testsuites/hello.exe"
        );
    }
}
