// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use camino_tempfile::Utf8TempDir;
use color_eyre::eyre::Result;
use indoc::indoc;
use pretty_assertions::assert_eq;
use rtems_tester_runner::{
    config::{ResolvedConfig, TesterSettings},
    log::RunLog,
    report::{Outcome, Report, RunSummary},
    scheduler::{Scheduler, SessionExecutor},
    signal::SignalHandler,
    test_list::TestList,
};
use std::{
    io::Write,
    net::TcpListener,
    sync::Arc,
    time::{Duration, Instant},
};

const STEP: Duration = Duration::from_millis(20);

fn config(pairs: &[(&str, &str)]) -> Result<ResolvedConfig> {
    let mut config = ResolvedConfig::from_sources(None, None)?;
    config.insert("arch", "sparc");
    config.insert("bsp", "erc32");
    config.insert("report_mode", "all");
    for (key, value) in pairs {
        config.insert(*key, *value);
    }
    Ok(config)
}

fn run(config: &ResolvedConfig, tests: &TestList) -> Result<(Arc<RunLog>, RunSummary)> {
    let settings = Arc::new(TesterSettings::from_config(config)?);
    let log = Arc::new(RunLog::buffer(false));
    let report = Report::new(
        log.clone(),
        settings.arch.clone(),
        settings.bsp.clone(),
        tests.len(),
        settings.report_mode,
    );
    let executor = SessionExecutor::new(settings.clone()).with_monitor_step(STEP);
    let summary = Scheduler::new(&report, settings.jobs, SignalHandler::noop())
        .with_tick(STEP)
        .run(tests, &executor);
    Ok((log, summary))
}

fn result_lines(log: &RunLog) -> Vec<String> {
    log.file_contents()
        .lines()
        .filter(|line| line.starts_with("Result:"))
        .map(|line| {
            let mut words = line.split_whitespace();
            let outcome = words.nth(1).unwrap_or_default().to_owned();
            let name = line.split("] ").nth(1).unwrap_or_default().to_owned();
            format!("{outcome} {name}")
        })
        .collect()
}

#[test]
fn execute_directory_of_tests() -> Result<()> {
    test_init();

    let dir = Utf8TempDir::new()?;
    write_script(
        dir.path(),
        "pass.exe",
        indoc! {r#"
            echo "*** BEGIN OF TEST PASS ***"
            echo "*** TEST VERSION: 6.0.0.abc"
            echo "*** TEST BUILD: RTEMS_SMP"
            echo "*** END OF TEST PASS ***"
        "#},
    )?;
    write_script(
        dir.path(),
        "fail.exe",
        indoc! {r#"
            echo "*** BEGIN OF TEST FAIL ***"
            echo "assertion failed" >&2
            exit 1
        "#},
    )?;
    write_script(
        dir.path(),
        "hang.exe",
        indoc! {r#"
            echo "*** BEGIN OF TEST HANG ***"
            exec sleep 60
        "#},
    )?;
    write_script(dir.path(), "invalid.exe", "exit 0\n")?;
    write_script(
        dir.path(),
        "linger.exe",
        indoc! {r#"
            echo "*** BEGIN OF TEST LINGER ***"
            echo "*** END OF TEST LINGER ***"
            exec sleep 60
        "#},
    )?;
    std::fs::write(dir.path().join("notes.txt"), "not a test")?;

    let tests = TestList::discover(&[dir.path().to_owned()])?;
    let config = config(&[("script", "execute @EXE@"), ("timeout", "2"), ("jobs", "3")])?;

    let started = Instant::now();
    let (log, summary) = run(&config, &tests)?;

    assert!(started.elapsed() < Duration::from_secs(30), "killed tests don't linger");
    assert_eq!(
        result_lines(&log),
        vec![
            "failed fail.exe (FAIL)",
            "timeout hang.exe (HANG)",
            "invalid invalid.exe",
            "passed linger.exe (LINGER)",
            "passed pass.exe (PASS)",
        ]
    );
    assert_eq!(summary.total, 5);
    assert_eq!(summary.counts.get(Outcome::Passed), 2);
    assert!(!summary.is_success());

    let contents = log.file_contents();
    assert!(contents.contains("  Version: 6.0.0.abc"), "log: {contents}");
    assert!(contents.contains("  Build: RTEMS_SMP"), "log: {contents}");
    assert!(contents.contains("*** TARGET ERROR 1"), "log: {contents}");
    assert!(contents.contains("assertion failed"), "log: {contents}");
    Ok(())
}

#[test]
fn power_commands_bracket_the_batch() -> Result<()> {
    test_init();

    let dir = Utf8TempDir::new()?;
    let power = dir.path().join("power.log");
    let exe = write_script(
        dir.path(),
        "hello.exe",
        indoc! {r#"
            echo "*** BEGIN OF TEST HELLO ***"
            echo "*** END OF TEST HELLO ***"
        "#},
    )?;
    let on = format!("echo on @BSP@ >> {power}");
    let off = format!("echo off >> {power}");
    let pretest = format!("echo pretest >> {power}");
    let config = config(&[
        ("script", "execute @EXE@"),
        ("target_on_command", &on),
        ("target_off_command", &off),
        ("target_pretest_command", &pretest),
        ("jobs", "1"),
    ])?;
    let tests = TestList::new([exe.clone(), exe]);

    let (_log, summary) = run(&config, &tests)?;

    assert!(summary.is_success());
    assert_eq!(
        std::fs::read_to_string(&power)?,
        "on erc32\npretest\npretest\noff\n"
    );
    Ok(())
}

#[test]
fn serial_console_with_wait() -> Result<()> {
    test_init();

    let dir = Utf8TempDir::new()?;
    let device = dir.path().join("ttyS0");
    std::fs::write(
        &device,
        indoc! {"
            RTEMS boot loader
            *** BEGIN OF TEST TICKER ***
            TA1 - rtems_clock_get_tod - 09:00:00
            *** END OF TEST TICKER ***
        "},
    )?;
    let exe = write_script(dir.path(), "ticker.exe", "exit 0\n")?;
    let script = format!("console tty {device}\nwait");
    let config = config(&[("script", &script), ("timeout", "10")])?;

    let (log, summary) = run(&config, &TestList::new([exe]))?;

    assert!(summary.is_success());
    assert_eq!(result_lines(&log), vec!["passed ticker.exe (TICKER)"]);
    assert!(log.file_contents().contains("TA1 - rtems_clock_get_tod"));
    Ok(())
}

#[test]
fn telnet_console_with_wait() -> Result<()> {
    test_init();

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let address = listener.local_addr()?;
    std::thread::spawn(move || -> std::io::Result<()> {
        let (mut stream, _) = listener.accept()?;
        // IAC WILL ECHO, then IAC WILL SUPPRESS-GO-AHEAD.
        stream.write_all(&[255, 251, 1, 255, 251, 3])?;
        stream.write_all(b"*** BEGIN OF TEST TELNET ***\r\n")?;
        std::thread::sleep(Duration::from_millis(50));
        stream.write_all(b"*** END OF TEST TELNET ***\r\n")?;
        // Keep the connection open: the end marker has to stop the run.
        std::thread::sleep(Duration::from_secs(10));
        Ok(())
    });

    let dir = Utf8TempDir::new()?;
    let exe = write_script(dir.path(), "telnet.exe", "exit 0\n")?;
    let script = format!("console telnet {address}\nwait");
    let config = config(&[("script", &script), ("timeout", "10")])?;

    let started = Instant::now();
    let (log, summary) = run(&config, &TestList::new([exe]))?;

    assert!(started.elapsed() < Duration::from_secs(5), "end marker stopped the wait");
    assert!(summary.is_success());
    assert_eq!(result_lines(&log), vec!["passed telnet.exe (TELNET)"]);
    Ok(())
}
