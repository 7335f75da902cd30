// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running many tests with bounded parallelism.
//!
//! The [`Scheduler`] keeps up to `jobs` tests running, each on its own thread. Tests may finish
//! in any order, but results are recorded in the [`Report`] in submission order: a finished test
//! waits until every test before it has been reported.

use crate::{
    capture::{CaptureBuffer, CaptureSource},
    classifier::TestMetadata,
    config::{TesterSettings, absolute_path},
    monitor::Monitor,
    report::{Outcome, Report, RunSummary, TestResult},
    session::{SessionHandle, TestSession},
    signal::{SignalEvent, SignalHandler},
    target_command::{TargetCommandKind, run_target_command},
    test_list::{TestInstance, TestList},
};
use crossbeam_channel::{Sender, unbounded};
use std::{
    any::Any,
    collections::{BTreeMap, VecDeque},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, warn};

/// Creates the work for each test. Implemented by [`SessionExecutor`] for real runs.
pub trait TestExecutor: Sync {
    /// Prepares `test` to run. Called on the scheduler thread.
    fn prepare(&self, test: &TestInstance) -> Box<dyn RunnableTest>;

    /// Called before the first test starts.
    fn batch_started(&self, tests: &TestList) {
        let _ = tests;
    }

    /// Called after the last test finished.
    fn batch_finished(&self, tests: &TestList) {
        let _ = tests;
    }
}

/// A prepared test, run on a worker thread.
pub trait RunnableTest: Send {
    /// Returns a handle the scheduler can kill the test with.
    fn kill_handle(&self) -> Arc<dyn KillTest>;

    /// Runs the test to completion.
    fn run(self: Box<Self>) -> TestResult;
}

/// Stops a running test. Must be idempotent.
pub trait KillTest: Send + Sync {
    /// Stops the test.
    fn kill(&self);
}

impl RunnableTest for TestSession {
    fn kill_handle(&self) -> Arc<dyn KillTest> {
        Arc::new(self.handle())
    }

    fn run(self: Box<Self>) -> TestResult {
        TestSession::run(*self)
    }
}

impl KillTest for SessionHandle {
    fn kill(&self) {
        SessionHandle::kill(self);
    }
}

/// Runs each test in a [`TestSession`], and the power commands around the batch.
#[derive(Clone, Debug)]
pub struct SessionExecutor {
    settings: Arc<TesterSettings>,
    monitor_step: Duration,
}

impl SessionExecutor {
    /// Creates an executor for the given settings.
    pub fn new(settings: Arc<TesterSettings>) -> Self {
        Self {
            settings,
            monitor_step: Monitor::DEFAULT_STEP,
        }
    }

    /// Sets the polling step of every test's monitor.
    pub fn with_monitor_step(mut self, step: Duration) -> Self {
        self.monitor_step = step;
        self
    }

    fn power_command(&self, kind: TargetCommandKind, test: Option<&TestInstance>) {
        let Some(test) = test else {
            return;
        };
        let full_exe = absolute_path(&test.exe);
        let placeholders = self.settings.placeholders(&test.exe, &full_exe);
        if let Some(output) = run_target_command(kind, &self.settings.commands, &placeholders) {
            info!(%kind, command = %output.command, success = output.success(), "target power command");
        }
    }
}

impl TestExecutor for SessionExecutor {
    fn prepare(&self, test: &TestInstance) -> Box<dyn RunnableTest> {
        Box::new(
            TestSession::new(self.settings.clone(), test.clone())
                .with_monitor_step(self.monitor_step),
        )
    }

    fn batch_started(&self, tests: &TestList) {
        self.power_command(TargetCommandKind::On, tests.iter().next());
    }

    fn batch_finished(&self, tests: &TestList) {
        self.power_command(TargetCommandKind::Off, tests.iter().last());
    }
}

/// Holds finished tests until every test before them has finished.
#[derive(Debug)]
struct ReportingCursor {
    order: VecDeque<usize>,
    finished: BTreeMap<usize, TestResult>,
}

impl ReportingCursor {
    fn new(order: impl IntoIterator<Item = usize>) -> Self {
        Self {
            order: order.into_iter().collect(),
            finished: BTreeMap::new(),
        }
    }

    /// Records a finished test, returning the results that can now be reported, in order.
    fn finish(&mut self, result: TestResult) -> Vec<TestResult> {
        self.finished.insert(result.index, result);
        let mut ready = Vec::new();
        while let Some(next) = self.order.front() {
            let Some(result) = self.finished.remove(next) else {
                break;
            };
            self.order.pop_front();
            ready.push(result);
        }
        ready
    }

    /// Returns everything left over, in index order.
    fn drain(self) -> impl Iterator<Item = TestResult> {
        self.finished.into_values()
    }
}

struct ActiveTest {
    kill: Arc<dyn KillTest>,
}

/// Runs a [`TestList`] with bounded parallelism.
pub struct Scheduler<'a> {
    report: &'a Report,
    jobs: usize,
    tick: Duration,
    handler: SignalHandler,
}

impl<'a> Scheduler<'a> {
    /// The default interval at which the scheduler checks on its workers.
    pub const DEFAULT_TICK: Duration = Duration::from_millis(250);

    /// Creates a scheduler that runs up to `jobs` tests at once and records into `report`.
    pub fn new(report: &'a Report, jobs: usize, handler: SignalHandler) -> Self {
        Self {
            report,
            jobs: jobs.max(1),
            tick: Self::DEFAULT_TICK,
            handler,
        }
    }

    /// Sets the tick interval.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Runs every test and writes the summary.
    ///
    /// If a test thread panics, the remaining tests are killed and the panic is resumed once all
    /// threads have stopped.
    pub fn run(self, tests: &TestList, executor: &dyn TestExecutor) -> RunSummary {
        executor.batch_started(tests);

        let mut pending: VecDeque<&TestInstance> = tests.iter().collect();
        let mut active: BTreeMap<usize, ActiveTest> = BTreeMap::new();
        let mut cursor = ReportingCursor::new(tests.iter().map(|test| test.index));
        let mut interrupted = false;
        let mut panic: Option<Box<dyn Any + Send>> = None;
        let (done_tx, done_rx) = unbounded::<(usize, std::thread::Result<TestResult>)>();

        std::thread::scope(|scope| {
            loop {
                while !interrupted && panic.is_none() && active.len() < self.jobs {
                    let Some(test) = pending.pop_front() else {
                        break;
                    };
                    self.start_test(scope, test, executor, &done_tx, &mut active, &mut cursor);
                }

                if active.is_empty() && (pending.is_empty() || interrupted || panic.is_some()) {
                    break;
                }

                crossbeam_channel::select! {
                    recv(done_rx) -> message => {
                        // The scheduler holds a sender, so this never disconnects.
                        let Ok((index, result)) = message else {
                            continue;
                        };
                        active.remove(&index);
                        match result {
                            Ok(result) => {
                                debug!(index, active = active.len(), "test finished");
                                for ready in cursor.finish(result) {
                                    self.report.finish(ready);
                                }
                            }
                            Err(payload) => {
                                warn!(index, "test thread panicked, stopping the run");
                                for test in active.values() {
                                    test.kill.kill();
                                }
                                panic.get_or_insert(payload);
                            }
                        }
                    }
                    recv(self.handler.receiver) -> event => {
                        if let Ok(SignalEvent::Interrupted) = event
                            && !interrupted
                        {
                            warn!(running = active.len(), "interrupted, killing running tests");
                            interrupted = true;
                            self.report.set_interrupted();
                            for test in active.values() {
                                test.kill.kill();
                            }
                        }
                    }
                    default(self.tick) => {}
                }
            }
        });

        // Tests after a gap left by an interrupted or panicked run.
        for result in cursor.drain() {
            self.report.finish(result);
        }
        executor.batch_finished(tests);

        if let Some(payload) = panic {
            std::panic::resume_unwind(payload);
        }
        self.report.write_summary()
    }

    // ---
    // Helper methods
    // ---

    fn start_test<'scope>(
        &self,
        scope: &'scope std::thread::Scope<'scope, '_>,
        test: &TestInstance,
        executor: &dyn TestExecutor,
        done_tx: &Sender<(usize, std::thread::Result<TestResult>)>,
        active: &mut BTreeMap<usize, ActiveTest>,
        cursor: &mut ReportingCursor,
    ) {
        self.report.start(test.index, &test.exe);
        let runnable = executor.prepare(test);
        let kill = runnable.kill_handle();
        let index = test.index;
        let done_tx = done_tx.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("test-{index}"))
            .spawn_scoped(scope, move || {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| runnable.run()));
                let _ = done_tx.send((index, result));
            });

        match spawned {
            Ok(_) => {
                debug!(index, active = active.len() + 1, "test started");
                active.insert(index, ActiveTest { kill });
            }
            Err(err) => {
                warn!(index, %err, "failed to start test thread");
                let mut output = CaptureBuffer::new();
                output.push(
                    CaptureSource::Notice,
                    format!("failed to start test thread: {err}"),
                );
                let result = TestResult {
                    index,
                    exe: test.exe.clone(),
                    outcome: Outcome::Invalid,
                    label: None,
                    metadata: TestMetadata::default(),
                    restarts: 0,
                    duration: Duration::ZERO,
                    output,
                };
                for ready in cursor.finish(result) {
                    self.report.finish(ready);
                }
            }
        }
    }
}

impl std::fmt::Debug for Scheduler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.jobs)
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{log::RunLog, report::ReportMode};
    use crossbeam_channel::{Receiver, bounded};
    use pretty_assertions::assert_eq;
    use std::{
        sync::Mutex,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Instant,
    };

    /// A test that finishes after a delay, or as soon as it's killed.
    struct FakeTest {
        test: TestInstance,
        delay: Duration,
        outcome: Outcome,
        killed: Arc<FakeKill>,
        panics: bool,
        running: Arc<AtomicUsize>,
        max_running: Arc<AtomicUsize>,
        finish_order: Arc<Mutex<Vec<usize>>>,
    }

    struct FakeKill {
        sender: Mutex<Option<Sender<()>>>,
        receiver: Receiver<()>,
        killed: AtomicBool,
    }

    impl KillTest for FakeKill {
        fn kill(&self) {
            self.killed.store(true, Ordering::Release);
            self.sender.lock().expect("not poisoned").take();
        }
    }

    impl RunnableTest for FakeTest {
        fn kill_handle(&self) -> Arc<dyn KillTest> {
            self.killed.clone()
        }

        fn run(self: Box<Self>) -> TestResult {
            let now = self.running.fetch_add(1, Ordering::AcqRel) + 1;
            self.max_running.fetch_max(now, Ordering::AcqRel);
            // Returns early when killed: the sender is dropped.
            let _ = self.killed.receiver.recv_timeout(self.delay);
            self.running.fetch_sub(1, Ordering::AcqRel);
            if self.panics {
                panic!("test {} panicked", self.test.index);
            }
            self.finish_order
                .lock()
                .expect("not poisoned")
                .push(self.test.index);
            let outcome = if self.killed.killed.load(Ordering::Acquire) {
                Outcome::Invalid
            } else {
                self.outcome
            };
            TestResult {
                index: self.test.index,
                exe: self.test.exe.clone(),
                outcome,
                label: None,
                metadata: TestMetadata::default(),
                restarts: 0,
                duration: self.delay,
                output: CaptureBuffer::new(),
            }
        }
    }

    #[derive(Default)]
    struct FakeExecutor {
        delays: BTreeMap<usize, Duration>,
        outcomes: BTreeMap<usize, Outcome>,
        panics: Option<usize>,
        running: Arc<AtomicUsize>,
        max_running: Arc<AtomicUsize>,
        finish_order: Arc<Mutex<Vec<usize>>>,
        batches: Mutex<Vec<&'static str>>,
    }

    impl TestExecutor for FakeExecutor {
        fn prepare(&self, test: &TestInstance) -> Box<dyn RunnableTest> {
            let (sender, receiver) = bounded(1);
            Box::new(FakeTest {
                test: test.clone(),
                delay: self
                    .delays
                    .get(&test.index)
                    .copied()
                    .unwrap_or(Duration::from_millis(10)),
                outcome: self
                    .outcomes
                    .get(&test.index)
                    .copied()
                    .unwrap_or(Outcome::Passed),
                killed: Arc::new(FakeKill {
                    sender: Mutex::new(Some(sender)),
                    receiver,
                    killed: AtomicBool::new(false),
                }),
                panics: self.panics == Some(test.index),
                running: self.running.clone(),
                max_running: self.max_running.clone(),
                finish_order: self.finish_order.clone(),
            })
        }

        fn batch_started(&self, _tests: &TestList) {
            self.batches.lock().expect("not poisoned").push("on");
        }

        fn batch_finished(&self, _tests: &TestList) {
            self.batches.lock().expect("not poisoned").push("off");
        }
    }

    fn tests(count: usize) -> TestList {
        TestList::new((1..=count).map(|idx| format!("t{idx}.exe")))
    }

    fn report(count: usize) -> (Arc<RunLog>, Report) {
        let log = Arc::new(RunLog::buffer(false));
        let report = Report::new(log.clone(), "sparc", "erc32", count, ReportMode::None);
        (log, report)
    }

    fn reported_order(log: &RunLog) -> Vec<String> {
        log.file_contents()
            .lines()
            .filter(|line| line.starts_with("Result:"))
            .filter_map(|line| line.split_whitespace().last().map(str::to_owned))
            .collect()
    }

    #[test]
    fn reports_in_submission_order() {
        let executor = FakeExecutor {
            delays: BTreeMap::from([
                (1, Duration::from_millis(150)),
                (2, Duration::from_millis(300)),
                (3, Duration::from_millis(10)),
            ]),
            ..Default::default()
        };
        let (log, report) = report(3);
        let summary = Scheduler::new(&report, 3, SignalHandler::noop())
            .with_tick(Duration::from_millis(10))
            .run(&tests(3), &executor);

        assert_eq!(*executor.finish_order.lock().expect("not poisoned"), vec![3, 1, 2]);
        assert_eq!(reported_order(&log), vec!["t1.exe", "t2.exe", "t3.exe"]);
        assert_eq!(summary.finished(), 3);
        assert!(summary.is_success());
        assert_eq!(*executor.batches.lock().expect("not poisoned"), vec!["on", "off"]);
    }

    #[test]
    fn respects_job_limit() {
        let executor = FakeExecutor::default();
        let (_log, report) = report(12);
        let summary = Scheduler::new(&report, 2, SignalHandler::noop())
            .with_tick(Duration::from_millis(5))
            .run(&tests(12), &executor);

        assert_eq!(summary.finished(), 12);
        assert!(executor.max_running.load(Ordering::Acquire) <= 2);
    }

    #[test]
    fn counts_every_outcome() {
        let executor = FakeExecutor {
            outcomes: BTreeMap::from([(2, Outcome::Failed), (4, Outcome::Timeout)]),
            ..Default::default()
        };
        let (_log, report) = report(5);
        let summary = Scheduler::new(&report, 4, SignalHandler::noop()).run(&tests(5), &executor);

        assert_eq!(summary.counts.total(), summary.total);
        assert_eq!(summary.counts.get(Outcome::Passed), 3);
        assert_eq!(
            summary.non_passing,
            vec![
                (Outcome::Failed, "t2.exe".to_owned()),
                (Outcome::Timeout, "t4.exe".to_owned()),
            ]
        );
        assert!(!summary.is_success());
    }

    #[test]
    fn interrupt_kills_running_tests() {
        let executor = FakeExecutor {
            delays: (1..=6).map(|idx| (idx, Duration::from_secs(60))).collect(),
            ..Default::default()
        };
        let (sender, handler) = SignalHandler::for_test();
        let (_log, report) = report(6);
        let interrupter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let _ = sender.send(SignalEvent::Interrupted);
        });

        let started = Instant::now();
        let summary = Scheduler::new(&report, 2, handler)
            .with_tick(Duration::from_millis(10))
            .run(&tests(6), &executor);
        interrupter.join().expect("interrupter finished");

        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(summary.interrupted);
        // Only the two running tests finished; the rest never started.
        assert_eq!(summary.finished(), 2);
        assert_eq!(summary.counts.get(Outcome::Invalid), 2);
    }

    #[test]
    fn worker_panic_is_resumed() {
        let executor = FakeExecutor {
            delays: BTreeMap::from([(2, Duration::from_secs(60))]),
            panics: Some(1),
            ..Default::default()
        };
        let (_log, report) = report(3);
        let started = Instant::now();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            Scheduler::new(&report, 2, SignalHandler::noop())
                .with_tick(Duration::from_millis(10))
                .run(&tests(3), &executor)
        }));

        assert!(result.is_err(), "panic was resumed");
        // Test 2 was killed rather than waited for, and test 3 never started.
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(*executor.finish_order.lock().expect("not poisoned"), vec![2]);
    }

    #[test]
    fn cursor_holds_later_results() {
        let result = |index| TestResult {
            index,
            exe: format!("t{index}.exe").into(),
            outcome: Outcome::Passed,
            label: None,
            metadata: TestMetadata::default(),
            restarts: 0,
            duration: Duration::ZERO,
            output: CaptureBuffer::new(),
        };
        let mut cursor = ReportingCursor::new([1, 2, 3, 4]);
        assert!(cursor.finish(result(3)).is_empty());
        assert!(cursor.finish(result(2)).is_empty());
        let ready: Vec<_> = cursor.finish(result(1)).iter().map(|r| r.index).collect();
        assert_eq!(ready, vec![1, 2, 3]);
        assert!(cursor.drain().next().is_none());
    }
}
