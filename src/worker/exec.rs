// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bucket execution inside the worker.
//!
//! Walks the file's suite tree in source order, runs `before_all`/`after_all`
//! hooks once per scope, and drives each assigned test through its hook
//! pipeline under a deadline race. User callables are raced via cooperative
//! cancellation: when the deadline fires, the pending future is dropped and
//! the remaining teardown re-races a fresh full-length deadline so cleanup
//! cannot hang the worker.

use crate::{
    config::Project,
    environment::{merge_args, EnvironmentStack},
    model::{
        expected_status, Annotation, AnnotationKind, ArgMap, FileSuite, SerializedError, Suite,
        SuiteChild, SuiteFn, TestFn, TestId, TestInfo, TestStatus, UserError, WorkerInfo,
    },
    protocol::{DoneMessage, RunMessage, TestEndMessage, TestEntry, WorkerMessage},
    time::far_future_duration,
};
use futures::FutureExt;
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// One suite scope, flattened out of the tree.
struct FlatScope {
    title: String,
    before_all: Vec<SuiteFn>,
    after_all: Vec<SuiteFn>,
    before_each: Vec<TestFn>,
    after_each: Vec<TestFn>,
    /// Whether this scope's `before_all` hooks were attempted.
    entered: bool,
    /// Set when a `before_all` hook failed; every remaining spec in the
    /// scope fails without running.
    fatal: Option<SerializedError>,
}

/// One spec, flattened with its inherited state resolved.
struct FlatSpec {
    ordinal: usize,
    titles: Vec<String>,
    annotations: Vec<Annotation>,
    body: TestFn,
    /// Scope indices from the root to the innermost enclosing suite.
    scope_path: Vec<usize>,
}

fn flatten(file_suite: &FileSuite) -> (Vec<FlatScope>, Vec<FlatSpec>) {
    let mut scopes = Vec::new();
    let mut specs = Vec::new();
    let mut ordinal = 0;
    flatten_suite(
        &file_suite.suite,
        &mut Vec::new(),
        &mut Vec::new(),
        &mut Vec::new(),
        &mut ordinal,
        &mut scopes,
        &mut specs,
    );
    (scopes, specs)
}

fn flatten_suite(
    suite: &Suite,
    path: &mut Vec<usize>,
    titles: &mut Vec<String>,
    annotations: &mut Vec<Annotation>,
    ordinal: &mut usize,
    scopes: &mut Vec<FlatScope>,
    specs: &mut Vec<FlatSpec>,
) {
    let scope_index = scopes.len();
    scopes.push(FlatScope {
        title: suite.title.clone(),
        before_all: suite.before_all.clone(),
        after_all: suite.after_all.clone(),
        before_each: suite.before_each.clone(),
        after_each: suite.after_each.clone(),
        entered: false,
        fatal: None,
    });
    path.push(scope_index);
    let annotations_base = annotations.len();
    annotations.extend(suite.annotations.iter().cloned());
    if !suite.title.is_empty() {
        titles.push(suite.title.clone());
    }

    for child in &suite.children {
        match child {
            SuiteChild::Suite(child_suite) => {
                flatten_suite(child_suite, path, titles, annotations, ordinal, scopes, specs);
            }
            SuiteChild::Spec(spec) => {
                let mut spec_titles = titles.clone();
                spec_titles.push(spec.title.clone());
                let mut spec_annotations = annotations.clone();
                spec_annotations.extend(spec.annotations.iter().cloned());
                specs.push(FlatSpec {
                    ordinal: *ordinal,
                    titles: spec_titles,
                    annotations: spec_annotations,
                    body: spec.body.clone(),
                    scope_path: path.clone(),
                });
                *ordinal += 1;
            }
        }
    }

    if !suite.title.is_empty() {
        titles.pop();
    }
    annotations.truncate(annotations_base);
    path.pop();
}

/// The result of racing one user callable against the deadline.
enum PhaseResult {
    Ok,
    Error(SerializedError),
    Skip(Option<String>),
    TimedOut,
}

/// Races a user callable against `deadline`, catching panics. On expiry the
/// future is dropped at its current await point and abandoned.
async fn race_phase<F>(deadline: Instant, fut: F) -> PhaseResult
where
    F: Future<Output = Result<(), UserError>>,
{
    match tokio::time::timeout_at(deadline, AssertUnwindSafe(fut).catch_unwind()).await {
        Err(_elapsed) => PhaseResult::TimedOut,
        Ok(Ok(Ok(()))) => PhaseResult::Ok,
        Ok(Ok(Err(UserError::Skip { reason }))) => PhaseResult::Skip(reason),
        Ok(Ok(Err(error))) => PhaseResult::Error(SerializedError::from_user_error(&error)),
        Ok(Err(payload)) => PhaseResult::Error(SerializedError::from_panic(payload)),
    }
}

/// Executes one bucket. Owns no IPC; emits events through the channel and
/// returns the terminal `done` payload for the bucket.
pub(crate) struct BucketRunner<'a> {
    pub(crate) project: &'a Project,
    pub(crate) run: &'a RunMessage,
    pub(crate) env: &'a EnvironmentStack,
    pub(crate) worker_info: &'a Arc<WorkerInfo>,
    pub(crate) emitter: &'a UnboundedSender<WorkerMessage>,
    pub(crate) current_test: &'a Mutex<Option<TestId>>,
    pub(crate) stop: &'a AtomicBool,
}

impl BucketRunner<'_> {
    /// The deadline used for `before_all`/`after_all` hooks, which run
    /// outside any single test's deadline.
    fn hook_deadline(&self) -> Instant {
        let period = if self.project.timeout.is_zero() {
            far_future_duration()
        } else {
            self.project.timeout
        };
        Instant::now() + period
    }

    fn emit(&self, message: WorkerMessage) {
        // A send failure means the channel is shutting down; events from
        // this point on are unobservable anyway.
        let _ = self.emitter.send(message);
    }

    pub(crate) async fn execute(mut self, file_suite: &FileSuite) -> DoneMessage {
        let (mut scopes, specs) = flatten(file_suite);

        let entries: HashMap<TestId, TestEntry> = self
            .run
            .entries
            .iter()
            .map(|entry| (entry.test_id.clone(), entry.clone()))
            .collect();

        // Resolve which flattened specs are assigned, in source order. Specs
        // whose id is not in the bucket are skipped silently.
        let assigned: Vec<(usize, TestEntry)> = specs
            .iter()
            .enumerate()
            .filter_map(|(index, spec)| {
                let id = TestId::compute(
                    &self.run.file,
                    spec.ordinal,
                    &self.run.variation_string,
                    self.run.repeat_each_index,
                );
                entries.get(&id).map(|entry| (index, entry.clone()))
            })
            .collect();

        let mut base_args = self.env.worker_args().clone();
        merge_args(&mut base_args, self.run.variation.clone());

        let mut executed: HashSet<TestId> = HashSet::new();
        let mut failed_test_id: Option<TestId> = None;
        let mut open: Vec<usize> = Vec::new();

        for (spec_index, entry) in &assigned {
            if self.stop.load(Ordering::Acquire) {
                debug!("stop requested, abandoning remaining entries");
                break;
            }
            let spec = &specs[*spec_index];

            // Close scopes the previous spec opened that this spec does not
            // share, innermost-first; then open the rest of this spec's
            // path, outermost-first.
            let common = open
                .iter()
                .zip(spec.scope_path.iter())
                .take_while(|(a, b)| a == b)
                .count();
            self.close_scopes(&mut scopes, &mut open, common).await;
            for &scope_index in &spec.scope_path[common..] {
                // A collapsed ancestor scope suppresses nested before_all
                // hooks; the specs inside fail via the ancestor's error.
                if !open.iter().any(|&i| scopes[i].fatal.is_some()) {
                    self.open_scope(&mut scopes, scope_index).await;
                }
                open.push(scope_index);
            }

            let scope_fatal = spec
                .scope_path
                .iter()
                .find_map(|&i| scopes[i].fatal.clone());

            // The spec's hook chains: before_each outermost-first in
            // declaration order, after_each innermost-first in reverse
            // declaration order.
            let before_each_hooks: Vec<TestFn> = spec
                .scope_path
                .iter()
                .flat_map(|&i| scopes[i].before_each.iter().cloned())
                .collect();
            let after_each_hooks: Vec<TestFn> = spec
                .scope_path
                .iter()
                .rev()
                .flat_map(|&i| scopes[i].after_each.iter().rev().cloned())
                .collect();

            self.run_test(
                spec,
                entry,
                &base_args,
                scope_fatal,
                before_each_hooks,
                after_each_hooks,
                &mut failed_test_id,
            )
            .await;
            executed.insert(entry.test_id.clone());
        }

        self.close_scopes(&mut scopes, &mut open, 0).await;

        let remaining: Vec<TestEntry> = self
            .run
            .entries
            .iter()
            .filter(|entry| !executed.contains(&entry.test_id))
            .cloned()
            .collect();

        DoneMessage {
            failed_test_id,
            fatal_error: None,
            remaining,
        }
    }

    /// Runs a scope's `before_all` hooks, outermost hook first. A failure
    /// poisons the scope: its remaining specs fail without running.
    async fn open_scope(&mut self, scopes: &mut [FlatScope], scope_index: usize) {
        let deadline = self.hook_deadline();
        scopes[scope_index].entered = true;
        for hook in scopes[scope_index].before_all.clone() {
            match race_phase(deadline, hook(self.worker_info.clone())).await {
                PhaseResult::Ok => {}
                PhaseResult::Skip(reason) => {
                    // A skip marker escaping a before_all hook is treated as
                    // a scope failure: there is no single test to skip.
                    scopes[scope_index].fatal = Some(SerializedError::from_message(
                        reason.unwrap_or_else(|| "skip in before_all".to_owned()),
                    ));
                    break;
                }
                PhaseResult::Error(error) => {
                    debug!(scope = %scopes[scope_index].title, "before_all failed");
                    scopes[scope_index].fatal = Some(error);
                    break;
                }
                PhaseResult::TimedOut => {
                    scopes[scope_index].fatal = Some(SerializedError::from_message(format!(
                        "before_all timed out after {:?}",
                        self.project.timeout
                    )));
                    break;
                }
            }
        }
    }

    /// Closes open scopes down to `keep`, innermost-first, running their
    /// `after_all` hooks in reverse declaration order. Hook failures are
    /// teardown errors; they never fail tests retroactively.
    async fn close_scopes(&mut self, scopes: &mut [FlatScope], open: &mut Vec<usize>, keep: usize) {
        while open.len() > keep {
            let scope_index = open.pop().expect("open is non-empty");
            if !scopes[scope_index].entered {
                continue;
            }
            let deadline = self.hook_deadline();
            for hook in scopes[scope_index].after_all.iter().rev().cloned() {
                match race_phase(deadline, hook(self.worker_info.clone())).await {
                    PhaseResult::Ok => {}
                    PhaseResult::Skip(_) => {}
                    PhaseResult::Error(error) => {
                        debug!(scope = %scopes[scope_index].title, "after_all failed");
                        self.emit(WorkerMessage::TeardownError { error });
                    }
                    PhaseResult::TimedOut => {
                        self.emit(WorkerMessage::TeardownError {
                            error: SerializedError::from_message(format!(
                                "after_all timed out after {:?}",
                                self.project.timeout
                            )),
                        });
                    }
                }
            }
        }
    }

    /// Runs one assigned test through the full pipeline.
    #[allow(clippy::too_many_arguments)]
    async fn run_test(
        &mut self,
        spec: &FlatSpec,
        entry: &TestEntry,
        base_args: &ArgMap,
        scope_fatal: Option<SerializedError>,
        before_each_hooks: Vec<TestFn>,
        after_each_hooks: Vec<TestFn>,
        failed_test_id: &mut Option<TestId>,
    ) {
        let test_id = entry.test_id.clone();
        self.emit(WorkerMessage::TestBegin {
            test_id: test_id.clone(),
            worker_index: self.worker_info.worker_index,
        });

        // Statically skipped: no TestInfo, no hooks, no deadline.
        if entry.skipped || expected_status(&spec.annotations) == TestStatus::Skipped {
            self.emit(WorkerMessage::TestEnd(TestEndMessage {
                test_id,
                duration: Duration::ZERO,
                status: TestStatus::Skipped,
                error: None,
                data: ArgMap::new(),
                expected_status: TestStatus::Skipped,
                annotations: spec.annotations.clone(),
                timeout: entry.timeout,
            }));
            return;
        }

        // A collapsed before_all scope fails the test without running it.
        if let Some(error) = scope_fatal {
            self.emit(WorkerMessage::TestEnd(TestEndMessage {
                test_id: test_id.clone(),
                duration: Duration::ZERO,
                status: TestStatus::Failed,
                error: Some(error),
                data: ArgMap::new(),
                expected_status: entry.expected_status,
                annotations: spec.annotations.clone(),
                timeout: entry.timeout,
            }));
            if entry.expected_status != TestStatus::Failed {
                *failed_test_id = Some(test_id);
            }
            return;
        }

        // The effective deadline: a slow annotation triples it, a dynamic
        // set_timeout overrides it, zero disables it.
        let mut timeout = entry.timeout;
        if spec
            .annotations
            .iter()
            .any(|a| a.kind == AnnotationKind::Slow)
        {
            timeout *= 3;
        }

        let info = Arc::new(TestInfo::new(
            test_id.clone(),
            self.project.clone(),
            self.run.file.clone(),
            spec.titles.clone(),
            entry.retry,
            self.run.repeat_each_index,
            self.worker_info.worker_index,
            entry.expected_status,
            spec.annotations.clone(),
            timeout,
        ));

        *self.current_test.lock().unwrap() = Some(test_id.clone());
        let stopwatch = crate::time::stopwatch();
        let attempt_start = Instant::now();

        let deadline_from = |start: Instant, info: &TestInfo| {
            let period = info.timeout();
            if period.is_zero() {
                start + far_future_duration()
            } else {
                start + period
            }
        };

        let mut timed_out = false;
        let mut skipped: Option<Option<String>> = None;
        let mut first_error: Option<SerializedError> = None;
        let mut args = base_args.clone();

        // Steps 4-6: environment before_each, user before_each chain
        // (outermost-first), then the body. The first failure, skip or
        // timeout short-circuits what remains of these steps.
        let mut proceed = true;
        match race_phase(
            deadline_from(attempt_start, &info),
            self.env.before_each(&info, &mut args),
        )
        .await
        {
            PhaseResult::Ok => {}
            PhaseResult::Skip(reason) => {
                skipped = Some(reason);
                proceed = false;
            }
            PhaseResult::Error(error) => {
                first_error = Some(error);
                proceed = false;
            }
            PhaseResult::TimedOut => {
                timed_out = true;
                proceed = false;
            }
        }

        for hook in before_each_hooks {
            if !proceed {
                break;
            }
            match race_phase(
                deadline_from(attempt_start, &info),
                hook(args.clone(), info.clone()),
            )
            .await
            {
                PhaseResult::Ok => {}
                PhaseResult::Skip(reason) => {
                    skipped = Some(reason);
                    proceed = false;
                }
                PhaseResult::Error(error) => {
                    first_error = Some(error);
                    proceed = false;
                }
                PhaseResult::TimedOut => {
                    timed_out = true;
                    proceed = false;
                }
            }
        }

        if proceed {
            match race_phase(
                deadline_from(attempt_start, &info),
                (spec.body)(args.clone(), info.clone()),
            )
            .await
            {
                PhaseResult::Ok => {}
                PhaseResult::Skip(reason) => skipped = Some(reason),
                PhaseResult::Error(error) => first_error = Some(error),
                PhaseResult::TimedOut => timed_out = true,
            }
        }

        // Steps 7-8: user after_each (innermost-first), then environment
        // after_each. Every hook runs regardless of prior failures; the
        // first error is preserved. After a timeout, teardown re-races a
        // fresh full-length deadline.
        let mut teardown_start = if timed_out { Instant::now() } else { attempt_start };
        for hook in after_each_hooks {
            match race_phase(
                deadline_from(teardown_start, &info),
                hook(args.clone(), info.clone()),
            )
            .await
            {
                PhaseResult::Ok => {}
                PhaseResult::Skip(_) => {}
                PhaseResult::Error(error) => {
                    first_error.get_or_insert(error);
                }
                PhaseResult::TimedOut => {
                    if !timed_out {
                        timed_out = true;
                        teardown_start = Instant::now();
                    }
                }
            }
        }

        match race_phase(
            deadline_from(teardown_start, &info),
            self.env.after_each(&info),
        )
        .await
        {
            PhaseResult::Ok => {}
            PhaseResult::Skip(_) => {}
            PhaseResult::Error(error) => {
                first_error.get_or_insert(error);
            }
            PhaseResult::TimedOut => timed_out = true,
        }

        let status = if timed_out {
            TestStatus::TimedOut
        } else if skipped.is_some() {
            TestStatus::Skipped
        } else if first_error.is_some() {
            TestStatus::Failed
        } else {
            TestStatus::Passed
        };

        if timed_out && first_error.is_none() {
            first_error = Some(SerializedError::from_message(format!(
                "test timed out after {:?}",
                info.timeout()
            )));
        }

        let expected = info.expected_status();
        self.emit(WorkerMessage::TestEnd(TestEndMessage {
            test_id: test_id.clone(),
            duration: stopwatch.snapshot().duration,
            status,
            error: first_error,
            data: info.data(),
            expected_status: expected,
            annotations: info.annotations(),
            timeout: info.timeout(),
        }));
        *self.current_test.lock().unwrap() = None;

        if status != TestStatus::Passed && status != expected {
            *failed_test_id = Some(test_id);
        }
    }
}
