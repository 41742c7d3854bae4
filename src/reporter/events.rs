// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run-level statistics and outcomes surfaced to reporters.

use crate::model::{TestResult, TestStatus};
use serde::{Deserialize, Serialize};

/// Why a run began cancelling before completion.
///
/// Ordered by severity: a cancellation in progress is only upgraded by a
/// more severe reason.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CancelReason {
    /// The `max_failures` limit was reached.
    TestFailure,
    /// The global deadline expired.
    GlobalTimeout,
    /// A termination signal (SIGHUP/SIGTERM/SIGQUIT) was received.
    Signal,
    /// SIGINT / Ctrl-C was received.
    Interrupt,
}

/// Statistics for a test run.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    /// The number of tests the plan scheduled, including statically skipped
    /// ones.
    pub initial_run_count: usize,
    /// The number of tests that reached a final outcome.
    pub finished_count: usize,
    /// Tests whose final outcome matched their expected status on the first
    /// attempt. Includes expected failures.
    pub passed: usize,
    /// Tests whose final outcome matched their expected status only after
    /// retries.
    pub flaky: usize,
    /// Tests whose final outcome was an unexpected failure.
    pub failed: usize,
    /// Tests whose final outcome was an unexpected timeout.
    pub timed_out: usize,
    /// Tests skipped, statically or dynamically.
    pub skipped: usize,
    /// Fatal errors: load failures, collapsed `before_all` scopes, worker
    /// crashes without an attributable test.
    pub fatal_errors: usize,
    /// Why the run was cancelled, if it was.
    pub cancel_reason: Option<CancelReason>,
}

impl RunStats {
    /// Returns true if every finished test reached its expected outcome and
    /// nothing fatal happened.
    pub fn is_success(&self) -> bool {
        self.failed == 0
            && self.timed_out == 0
            && self.fatal_errors == 0
            && self.cancel_reason.is_none()
    }

    /// The process exit code the front end should use: 0 on all expected
    /// outcomes, 1 on failures or setup errors, 130 on interrupt.
    pub fn exit_code(&self) -> i32 {
        if self.cancel_reason == Some(CancelReason::Interrupt) {
            130
        } else if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Folds a finished test's attempt history into the stats.
    ///
    /// `results` holds every attempt in order; `expected` is the test's
    /// expected status at the end of the last attempt.
    pub(crate) fn on_test_finished(&mut self, results: &[TestResult], expected: TestStatus) {
        let Some(last) = results.last() else {
            return;
        };
        self.finished_count += 1;
        if last.status == TestStatus::Skipped {
            self.skipped += 1;
        } else if last.status == expected {
            if results.len() > 1 {
                self.flaky += 1;
            } else {
                self.passed += 1;
            }
        } else if last.status == TestStatus::TimedOut {
            self.timed_out += 1;
        } else {
            // Covers both unexpected failures and "passed unexpectedly".
            self.failed += 1;
        }
    }

    /// The number of unexpected outcomes so far, used for `max_failures`.
    pub fn failure_count(&self) -> usize {
        self.failed + self.timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn result(retry: u32, status: TestStatus) -> TestResult {
        TestResult {
            retry,
            worker_index: Some(0),
            duration: Duration::from_millis(5),
            status,
            error: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            data: Default::default(),
            annotations: Vec::new(),
        }
    }

    #[test]
    fn flaky_versus_passed() {
        let mut stats = RunStats::default();
        stats.on_test_finished(&[result(0, TestStatus::Passed)], TestStatus::Passed);
        stats.on_test_finished(
            &[result(0, TestStatus::Failed), result(1, TestStatus::Passed)],
            TestStatus::Passed,
        );
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.flaky, 1);
        assert!(stats.is_success());
        assert_eq!(stats.exit_code(), 0);
    }

    #[test]
    fn expected_failure_counts_as_passed() {
        let mut stats = RunStats::default();
        stats.on_test_finished(&[result(0, TestStatus::Failed)], TestStatus::Failed);
        assert_eq!(stats.passed, 1);
        assert!(stats.is_success());
    }

    #[test]
    fn passed_unexpectedly_counts_as_failed() {
        let mut stats = RunStats::default();
        stats.on_test_finished(&[result(0, TestStatus::Passed)], TestStatus::Failed);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.exit_code(), 1);
    }

    #[test]
    fn interrupt_exit_code() {
        let stats = RunStats {
            cancel_reason: Some(CancelReason::Interrupt),
            ..RunStats::default()
        };
        assert_eq!(stats.exit_code(), 130);

        let stats = RunStats {
            cancel_reason: Some(CancelReason::GlobalTimeout),
            ..RunStats::default()
        };
        assert_eq!(stats.exit_code(), 1);
    }

    #[test]
    fn unexpected_timeout_is_tracked_separately() {
        let mut stats = RunStats::default();
        stats.on_test_finished(&[result(0, TestStatus::TimedOut)], TestStatus::Passed);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.failure_count(), 1);
    }
}
