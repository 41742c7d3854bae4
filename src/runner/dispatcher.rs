// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The controller for the test run.
//!
//! This module interfaces with the external world and the worker pool. It
//! receives events from workers and from other inputs (signals, the global
//! deadline), schedules buckets onto idle slots, handles crashes and
//! retries, and sends events to the reporter fan-out.

use crate::{
    config::{RunConfig, SHUTDOWN_GRACE_PERIOD},
    model::{ArgMap, SerializedError, Test, TestId, TestResult, TestStatus},
    planner::TestPlan,
    protocol::{
        DoneMessage, InitMessage, ParentMessage, RunMessage, StdioChunk, TestEndMessage, TestEntry,
        WorkerMessage,
    },
    reporter::{
        events::{CancelReason, RunStats},
        ReporterMux,
    },
    runner::{
        internal_events::{SlotState, WorkerEvent},
        pool::{WorkerHandle, WorkerLauncher},
    },
    signal::{ShutdownEvent, SignalHandler},
    time::far_future_duration,
};
use camino::Utf8PathBuf;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// Give up on a run whose workers die during initialization this many times
/// in a row.
const MAX_INIT_FAILURES: usize = 3;

/// A bucket waiting to be dispatched. Retry and follow-up buckets carry
/// per-entry retry counters.
#[derive(Clone, Debug)]
struct PendingBucket {
    project: String,
    file: Utf8PathBuf,
    variation: ArgMap,
    variation_string: String,
    repeat_index: u32,
    entries: Vec<(Arc<Test>, u32)>,
}

impl PendingBucket {
    fn affinity(&self) -> (&str, &str) {
        (&self.project, &self.variation_string)
    }

    fn run_message(&self) -> RunMessage {
        RunMessage {
            project: self.project.clone(),
            file: self.file.clone(),
            entries: self
                .entries
                .iter()
                .map(|(test, retry)| TestEntry {
                    test_id: test.id.clone(),
                    retry: *retry,
                    expected_status: test.expected_status,
                    skipped: test.expected_status == TestStatus::Skipped,
                    timeout: test.timeout,
                })
                .collect(),
            variation: self.variation.clone(),
            variation_string: self.variation_string.clone(),
            repeat_each_index: self.repeat_index,
        }
    }
}

/// What one assigned slot is currently working on.
#[derive(Debug)]
struct Assignment {
    bucket: PendingBucket,
    in_flight: Option<TestId>,
    stdout: Vec<Vec<u8>>,
    stderr: Vec<Vec<u8>>,
    completed: Vec<TestId>,
}

#[derive(Debug)]
struct WorkerSlot {
    state: SlotState,
    handle: Option<WorkerHandle>,
    affinity: Option<(String, String)>,
    assignment: Option<Assignment>,
}

impl WorkerSlot {
    fn vacant() -> Self {
        Self {
            state: SlotState::Vacant,
            handle: None,
            affinity: None,
            assignment: None,
        }
    }

    fn is_live(&self) -> bool {
        self.state != SlotState::Vacant
    }
}

/// Drives the planned workload across the worker pool.
pub(crate) struct DispatcherContext<'a> {
    config: &'a RunConfig,
    plan: &'a TestPlan,
    launcher: &'a dyn WorkerLauncher,
    reporters: &'a mut ReporterMux,
    events_tx: UnboundedSender<(usize, WorkerEvent)>,
    slots: Vec<WorkerSlot>,
    pending: VecDeque<PendingBucket>,
    tests_by_id: HashMap<TestId, Arc<Test>>,
    results: BTreeMap<TestId, Vec<TestResult>>,
    stats: RunStats,
    cancel: Option<CancelReason>,
    stop_broadcast: bool,
    init_failures: usize,
}

impl<'a> DispatcherContext<'a> {
    pub(crate) fn new(
        config: &'a RunConfig,
        plan: &'a TestPlan,
        launcher: &'a dyn WorkerLauncher,
        reporters: &'a mut ReporterMux,
        events_tx: UnboundedSender<(usize, WorkerEvent)>,
    ) -> Self {
        let worker_cap = config.workers.max(1).min(plan.buckets.len());
        let pending = plan
            .buckets
            .iter()
            .map(|bucket| PendingBucket {
                project: bucket.key.project.clone(),
                file: bucket.key.file.clone(),
                variation: bucket.variation.clone(),
                variation_string: bucket.variation_string.clone(),
                repeat_index: bucket.key.repeat_index,
                entries: bucket.tests.iter().map(|t| (t.clone(), 0)).collect(),
            })
            .collect();

        Self {
            config,
            plan,
            launcher,
            reporters,
            events_tx,
            slots: (0..worker_cap).map(|_| WorkerSlot::vacant()).collect(),
            pending,
            tests_by_id: plan
                .tests
                .iter()
                .map(|t| (t.id.clone(), t.clone()))
                .collect(),
            results: BTreeMap::new(),
            stats: RunStats {
                initial_run_count: plan.test_count(),
                ..RunStats::default()
            },
            cancel: None,
            stop_broadcast: false,
            init_failures: 0,
        }
    }

    pub(crate) fn run_stats(&self) -> RunStats {
        let mut stats = self.stats;
        stats.cancel_reason = self.cancel;
        stats
    }

    pub(crate) fn into_results(self) -> BTreeMap<TestId, Vec<TestResult>> {
        self.results
    }

    /// Runs the dispatcher to completion: until the workload is drained and
    /// every worker has exited.
    pub(crate) async fn run(
        &mut self,
        events_rx: &mut UnboundedReceiver<(usize, WorkerEvent)>,
        signal_handler: &mut SignalHandler,
    ) {
        self.reporters.on_begin(self.config, self.plan);

        let global_period = if self.config.global_timeout.is_zero() {
            far_future_duration()
        } else {
            self.config.global_timeout
        };
        let global_sleep = tokio::time::sleep(global_period);
        tokio::pin!(global_sleep);
        let mut global_fired = false;

        let grace_sleep = tokio::time::sleep(far_future_duration());
        tokio::pin!(grace_sleep);
        let mut grace_armed = false;

        let mut signals_done = false;

        loop {
            self.pump();

            if self.stop_broadcast && !grace_armed {
                grace_armed = true;
                grace_sleep
                    .as_mut()
                    .reset(tokio::time::Instant::now() + SHUTDOWN_GRACE_PERIOD);
            }
            if self.finished() {
                break;
            }

            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some((slot_index, event)) => self.handle_event(slot_index, event),
                        None => break,
                    }
                }
                signal = signal_handler.recv(), if !signals_done => {
                    match signal {
                        Some(event) => self.handle_signal(event),
                        None => signals_done = true,
                    }
                }
                _ = &mut global_sleep, if !global_fired => {
                    debug!("global deadline expired");
                    global_fired = true;
                    self.begin_cancel(CancelReason::GlobalTimeout);
                    self.kill_all();
                }
                _ = &mut grace_sleep, if grace_armed && self.has_live_workers() => {
                    debug!("shutdown grace period expired, killing workers");
                    self.kill_all();
                }
            }
        }

        let stats = self.run_stats();
        if self.cancel == Some(CancelReason::GlobalTimeout) {
            self.reporters.on_timeout(&stats);
        } else {
            self.reporters.on_end(&stats);
        }
    }

    fn has_live_workers(&self) -> bool {
        self.slots.iter().any(WorkerSlot::is_live)
    }

    /// Work is drained when nothing is pending (or the run is cancelled)
    /// and no slot is mid-bucket.
    fn work_drained(&self) -> bool {
        (self.pending.is_empty() || self.cancel.is_some())
            && self
                .slots
                .iter()
                .all(|slot| slot.state != SlotState::Assigned)
    }

    fn finished(&self) -> bool {
        self.work_drained() && !self.has_live_workers()
    }

    /// Spawns and assigns workers as capacity and pending work allow, and
    /// starts the shutdown once the workload is drained.
    fn pump(&mut self) {
        if self.cancel.is_none() {
            // Assign pending buckets to idle slots, preferring slots whose
            // previous bucket shared the same worker-scoped state.
            loop {
                let Some(slot_index) = self
                    .slots
                    .iter()
                    .position(|slot| slot.state == SlotState::Idle)
                else {
                    break;
                };
                if self.pending.is_empty() {
                    break;
                }
                let bucket_index = self.slots[slot_index]
                    .affinity
                    .as_ref()
                    .and_then(|(project, variation)| {
                        self.pending
                            .iter()
                            .position(|b| b.affinity() == (project.as_str(), variation.as_str()))
                    })
                    .unwrap_or(0);
                let bucket = self
                    .pending
                    .remove(bucket_index)
                    .expect("bucket index is in range");
                self.assign(slot_index, bucket);
            }

            // Spawn workers for the remaining backlog.
            while !self.pending.is_empty() {
                let Some(slot_index) = self
                    .slots
                    .iter()
                    .position(|slot| slot.state == SlotState::Vacant)
                else {
                    break;
                };
                let spawning = self
                    .slots
                    .iter()
                    .filter(|slot| slot.state == SlotState::Initializing)
                    .count();
                if spawning >= self.pending.len() {
                    break;
                }
                self.spawn(slot_index);
            }
        }

        if self.work_drained() && !self.stop_broadcast && self.has_live_workers() {
            self.begin_shutdown();
        }
    }

    fn spawn(&mut self, slot_index: usize) {
        match self.launcher.launch(slot_index, self.events_tx.clone()) {
            Ok(handle) => {
                handle.send(ParentMessage::Init(InitMessage {
                    worker_index: slot_index,
                    loader: crate::config::LoaderSnapshot {
                        config: self.config.clone(),
                    },
                    fixture_files: self.fixture_files(),
                }));
                let slot = &mut self.slots[slot_index];
                slot.handle = Some(handle);
                slot.state = SlotState::Initializing;
            }
            Err(error) => {
                warn!(slot = slot_index, %error, "failed to spawn worker");
                self.record_init_failure(SerializedError::from_message(error.to_string()));
            }
        }
    }

    fn fixture_files(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .config
            .projects
            .iter()
            .flat_map(|p| p.use_environments.iter().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn assign(&mut self, slot_index: usize, bucket: PendingBucket) {
        let run = bucket.run_message();
        let sent = self.slots[slot_index]
            .handle
            .as_ref()
            .map(|handle| handle.send(ParentMessage::Run(run)))
            .unwrap_or(false);
        if !sent {
            // The worker died between Ready and the assignment. Vacate the
            // slot now so the scheduling loop does not pick it again; the
            // exit event for it becomes a no-op.
            debug!(slot = slot_index, "assignment failed, requeueing bucket");
            let slot = &mut self.slots[slot_index];
            slot.handle = None;
            slot.state = SlotState::Vacant;
            self.pending.push_front(bucket);
            return;
        }
        let slot = &mut self.slots[slot_index];
        slot.affinity = Some((bucket.project.clone(), bucket.variation_string.clone()));
        slot.assignment = Some(Assignment {
            bucket,
            in_flight: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            completed: Vec::new(),
        });
        slot.state = SlotState::Assigned;
    }

    fn handle_signal(&mut self, event: ShutdownEvent) {
        let reason = match event {
            ShutdownEvent::Interrupt => CancelReason::Interrupt,
            #[cfg(unix)]
            ShutdownEvent::Hangup | ShutdownEvent::Term | ShutdownEvent::Quit => {
                CancelReason::Signal
            }
        };
        self.begin_cancel(reason);
    }

    /// Begins cancellation. A cancellation in progress is only upgraded by
    /// a more severe reason.
    fn begin_cancel(&mut self, reason: CancelReason) {
        if self.cancel < Some(reason) {
            self.cancel = Some(reason);
            self.begin_shutdown();
        }
    }

    fn begin_shutdown(&mut self) {
        self.stop_broadcast = true;
        for slot in &self.slots {
            if let (true, Some(handle)) = (slot.is_live(), slot.handle.as_ref()) {
                let _ = handle.send(ParentMessage::Stop {});
            }
        }
    }

    fn kill_all(&mut self) {
        for slot in &mut self.slots {
            if let Some(handle) = slot.handle.as_mut() {
                handle.kill();
            }
        }
    }

    fn handle_event(&mut self, slot_index: usize, event: WorkerEvent) {
        match event {
            WorkerEvent::Message(WorkerMessage::Ready {}) => {
                self.init_failures = 0;
                let slot = &mut self.slots[slot_index];
                if slot.state == SlotState::Initializing {
                    slot.state = SlotState::Idle;
                }
            }
            WorkerEvent::Message(WorkerMessage::TestBegin { test_id, .. }) => {
                if let Some(assignment) = self.slots[slot_index].assignment.as_mut() {
                    assignment.in_flight = Some(test_id.clone());
                }
                if let Some(test) = self.tests_by_id.get(&test_id).cloned() {
                    self.reporters.on_test_begin(&test);
                }
            }
            WorkerEvent::Message(WorkerMessage::StdOut(chunk)) => {
                self.handle_stdio(slot_index, chunk, true);
            }
            WorkerEvent::Message(WorkerMessage::StdErr(chunk)) => {
                self.handle_stdio(slot_index, chunk, false);
            }
            WorkerEvent::Message(WorkerMessage::TestEnd(end)) => {
                self.handle_test_end(slot_index, end);
            }
            WorkerEvent::Message(WorkerMessage::Done(done)) => {
                self.handle_done(slot_index, done);
            }
            WorkerEvent::Message(WorkerMessage::TeardownError { error }) => {
                warn!(slot = slot_index, message = %error.message, "teardown error");
                self.reporters.on_error(&error);
            }
            WorkerEvent::Exited { code } => {
                self.handle_exit(slot_index, code);
            }
        }
    }

    fn handle_stdio(&mut self, slot_index: usize, chunk: StdioChunk, is_stdout: bool) {
        let bytes = chunk.bytes();
        if let Some(assignment) = self.slots[slot_index].assignment.as_mut() {
            if chunk.test_id.is_some() && chunk.test_id == assignment.in_flight {
                if is_stdout {
                    assignment.stdout.push(bytes.clone());
                } else {
                    assignment.stderr.push(bytes.clone());
                }
            }
        }
        let test = chunk
            .test_id
            .as_ref()
            .and_then(|id| self.tests_by_id.get(id))
            .cloned();
        if is_stdout {
            self.reporters.on_std_out(test.as_deref(), &bytes);
        } else {
            self.reporters.on_std_err(test.as_deref(), &bytes);
        }
    }

    fn handle_test_end(&mut self, slot_index: usize, end: TestEndMessage) {
        let Some(test) = self.tests_by_id.get(&end.test_id).cloned() else {
            warn!(slot = slot_index, test_id = %end.test_id, "test end for unknown test");
            return;
        };

        let (stdout, stderr) = match self.slots[slot_index].assignment.as_mut() {
            Some(assignment) => {
                assignment.in_flight = None;
                assignment.completed.push(end.test_id.clone());
                (
                    std::mem::take(&mut assignment.stdout),
                    std::mem::take(&mut assignment.stderr),
                )
            }
            None => (Vec::new(), Vec::new()),
        };

        let retry = self.slots[slot_index]
            .assignment
            .as_ref()
            .and_then(|a| {
                a.bucket
                    .entries
                    .iter()
                    .find(|(t, _)| t.id == end.test_id)
                    .map(|(_, retry)| *retry)
            })
            .unwrap_or(0);

        let result = TestResult {
            retry,
            worker_index: Some(slot_index),
            duration: end.duration,
            status: end.status,
            error: end.error,
            stdout,
            stderr,
            data: end.data,
            annotations: end.annotations,
        };
        self.record_attempt(&test, result, end.expected_status);
    }

    /// Records one attempt, reports it, and decides between retry and
    /// retirement.
    fn record_attempt(&mut self, test: &Arc<Test>, result: TestResult, expected: TestStatus) {
        let attempts = self.results.entry(test.id.clone()).or_default();
        attempts.push(result);
        let attempts_so_far = attempts.len();
        let result_ref = attempts.last().expect("just pushed").clone();

        self.reporters.on_test_end(test, &result_ref);

        let retryable = matches!(result_ref.status, TestStatus::Failed | TestStatus::TimedOut)
            && expected == TestStatus::Passed
            && attempts_so_far < 1 + test.retries as usize
            && self.cancel.is_none();

        if retryable {
            debug!(test_id = %test.id, attempt = attempts_so_far, "scheduling retry");
            self.pending.push_front(PendingBucket {
                project: test.project.clone(),
                file: test.file.clone(),
                variation: test.variation.clone(),
                variation_string: test.variation_string.clone(),
                repeat_index: test.repeat_index,
                entries: vec![(test.clone(), attempts_so_far as u32)],
            });
            return;
        }

        let attempts = self.results[&test.id].clone();
        self.stats.on_test_finished(&attempts, expected);
        if self.config.max_failures > 0 && self.stats.failure_count() >= self.config.max_failures {
            debug!("max failures reached, cancelling");
            self.begin_cancel(CancelReason::TestFailure);
        }
    }

    fn handle_done(&mut self, slot_index: usize, done: DoneMessage) {
        let slot = &mut self.slots[slot_index];
        let Some(assignment) = slot.assignment.take() else {
            // The final done a worker sends on stop while idle.
            debug!(slot = slot_index, "done with no assignment");
            return;
        };
        if slot.state == SlotState::Assigned {
            slot.state = SlotState::Idle;
        }

        if let Some(fatal) = done.fatal_error {
            // Load or environment setup failure: the whole bucket fails and
            // is not retried.
            self.stats.fatal_errors += 1;
            self.reporters.on_error(&fatal);
            for entry in &done.remaining {
                let Some(test) = self.tests_by_id.get(&entry.test_id).cloned() else {
                    continue;
                };
                self.synthesize_outcome(&test, entry.retry, slot_index, fatal.clone());
            }
            return;
        }

        if !done.remaining.is_empty() && self.cancel.is_none() {
            // The worker exited before finishing its bucket. The failed
            // test (if any) already went through retry accounting on its
            // testEnd; remaining tests are rescheduled without consuming a
            // retry.
            debug!(
                slot = slot_index,
                remaining = done.remaining.len(),
                "requeueing unexecuted entries"
            );
            self.requeue_remaining(&assignment.bucket, &done.remaining);
        }
    }

    fn requeue_remaining(&mut self, bucket: &PendingBucket, remaining: &[TestEntry]) {
        let entries: Vec<(Arc<Test>, u32)> = remaining
            .iter()
            .filter_map(|entry| {
                self.tests_by_id
                    .get(&entry.test_id)
                    .map(|test| (test.clone(), entry.retry))
            })
            .collect();
        if entries.is_empty() {
            return;
        }
        self.pending.push_front(PendingBucket {
            project: bucket.project.clone(),
            file: bucket.file.clone(),
            variation: bucket.variation.clone(),
            variation_string: bucket.variation_string.clone(),
            repeat_index: bucket.repeat_index,
            entries,
        });
    }

    /// Reports a test that never ran (or whose worker vanished mid-flight)
    /// with a synthesized outcome: failed, or skipped if that was expected.
    fn synthesize_outcome(
        &mut self,
        test: &Arc<Test>,
        retry: u32,
        slot_index: usize,
        error: SerializedError,
    ) {
        self.reporters.on_test_begin(test);
        let skipped = test.expected_status == TestStatus::Skipped;
        let result = TestResult {
            retry,
            worker_index: Some(slot_index),
            duration: Duration::ZERO,
            status: if skipped {
                TestStatus::Skipped
            } else {
                TestStatus::Failed
            },
            error: (!skipped).then_some(error),
            stdout: Vec::new(),
            stderr: Vec::new(),
            data: ArgMap::new(),
            annotations: test.annotations.clone(),
        };
        // Bucket-fatal outcomes are never retried: report and retire.
        let attempts = self.results.entry(test.id.clone()).or_default();
        attempts.push(result.clone());
        let attempts = attempts.clone();
        self.reporters.on_test_end(test, &result);
        self.stats.on_test_finished(&attempts, test.expected_status);
    }

    fn handle_exit(&mut self, slot_index: usize, code: Option<i32>) {
        let state = self.slots[slot_index].state;
        let assignment = self.slots[slot_index].assignment.take();
        {
            let slot = &mut self.slots[slot_index];
            slot.state = SlotState::Vacant;
            slot.handle = None;
        }

        match state {
            SlotState::Assigned => {
                // Crash mid-bucket: fail the in-flight test, reschedule the
                // rest on a fresh worker without consuming their retries.
                let Some(assignment) = assignment else {
                    return;
                };
                debug!(slot = slot_index, ?code, "worker exited mid-bucket");
                if let Some(test_id) = &assignment.in_flight {
                    if let Some(test) = self.tests_by_id.get(test_id).cloned() {
                        let retry = assignment
                            .bucket
                            .entries
                            .iter()
                            .find(|(t, _)| &t.id == test_id)
                            .map(|(_, retry)| *retry)
                            .unwrap_or(0);
                        let error = SerializedError::from_message(match code {
                            Some(code) => {
                                format!("worker process exited unexpectedly with code {code}")
                            }
                            None => "worker process exited unexpectedly".to_owned(),
                        });
                        let result = TestResult {
                            retry,
                            worker_index: Some(slot_index),
                            duration: Duration::ZERO,
                            status: TestStatus::Failed,
                            error: Some(error),
                            stdout: assignment.stdout.clone(),
                            stderr: assignment.stderr.clone(),
                            data: ArgMap::new(),
                            annotations: test.annotations.clone(),
                        };
                        // The crash consumes the in-flight test's attempt.
                        self.record_attempt(&test, result, test.expected_status);
                    }
                }
                if self.cancel.is_none() {
                    let remaining: Vec<TestEntry> = assignment
                        .bucket
                        .entries
                        .iter()
                        .filter(|(test, _)| {
                            !assignment.completed.contains(&test.id)
                                && assignment.in_flight.as_ref() != Some(&test.id)
                        })
                        .map(|(test, retry)| TestEntry {
                            test_id: test.id.clone(),
                            retry: *retry,
                            expected_status: test.expected_status,
                            skipped: test.expected_status == TestStatus::Skipped,
                            timeout: test.timeout,
                        })
                        .collect();
                    self.requeue_remaining(&assignment.bucket, &remaining);
                }
            }
            SlotState::Initializing => {
                warn!(slot = slot_index, ?code, "worker died during initialization");
                self.record_init_failure(SerializedError::from_message(
                    "worker died during initialization".to_owned(),
                ));
            }
            SlotState::Idle | SlotState::Vacant => {}
        }
    }

    fn record_init_failure(&mut self, error: SerializedError) {
        self.init_failures += 1;
        if self.init_failures >= MAX_INIT_FAILURES {
            warn!("giving up after {MAX_INIT_FAILURES} consecutive worker init failures");
            self.stats.fatal_errors += 1;
            self.reporters.on_error(&error);
            self.pending.clear();
            self.begin_shutdown();
        }
    }
}
