// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reporting: the callback surface reporters implement, and the fan-out
//! multiplexer the dispatcher drives.
//!
//! Reporter implementations (terminal renderers, file writers) live outside
//! this crate. The dispatcher guarantees call ordering per test -- `on_begin`
//! once, then per-test begin/stdio/end events, finally exactly one of
//! `on_end` or `on_timeout` -- and tolerates reporter failures: an error
//! returned by one reporter is surfaced on the error channel and never
//! propagated into the run.

pub mod events;

use crate::{
    config::RunConfig,
    model::{SerializedError, Test, TestResult},
    planner::TestPlan,
};
use events::RunStats;

/// The error type reporters may return. Reporter errors never fail the run.
pub type ReporterError = Box<dyn std::error::Error + Send + Sync>;

/// The reporter callback surface.
///
/// All methods default to no-ops, so implementations override only what
/// they render. Implementations must be tolerant of missing retries and
/// partial output: a crashed worker may leave a test with fewer results
/// than announced.
pub trait Reporter: Send {
    /// Called once before any test starts.
    fn on_begin(&mut self, config: &RunConfig, plan: &TestPlan) -> Result<(), ReporterError> {
        let _ = (config, plan);
        Ok(())
    }

    /// A test attempt started.
    fn on_test_begin(&mut self, test: &Test) -> Result<(), ReporterError> {
        let _ = test;
        Ok(())
    }

    /// A stdout fragment arrived, attributed to `test` when one was running.
    fn on_std_out(&mut self, test: Option<&Test>, chunk: &[u8]) -> Result<(), ReporterError> {
        let _ = (test, chunk);
        Ok(())
    }

    /// A stderr fragment arrived.
    fn on_std_err(&mut self, test: Option<&Test>, chunk: &[u8]) -> Result<(), ReporterError> {
        let _ = (test, chunk);
        Ok(())
    }

    /// A test attempt finished.
    fn on_test_end(&mut self, test: &Test, result: &TestResult) -> Result<(), ReporterError> {
        let _ = (test, result);
        Ok(())
    }

    /// A non-test error surfaced: a fatal worker error, a teardown error, or
    /// another reporter's failure.
    fn on_error(&mut self, error: &SerializedError) -> Result<(), ReporterError> {
        let _ = error;
        Ok(())
    }

    /// The global deadline expired. Emitted in place of `on_end`.
    fn on_timeout(&mut self, stats: &RunStats) -> Result<(), ReporterError> {
        let _ = stats;
        Ok(())
    }

    /// The run completed.
    fn on_end(&mut self, stats: &RunStats) -> Result<(), ReporterError> {
        let _ = stats;
        Ok(())
    }
}

/// Fans lifecycle callbacks out to every registered reporter, in
/// registration order.
#[derive(Default)]
pub struct ReporterMux {
    reporters: Vec<Box<dyn Reporter>>,
}

impl ReporterMux {
    /// Creates a multiplexer over the given reporters.
    pub fn new(reporters: Vec<Box<dyn Reporter>>) -> Self {
        Self { reporters }
    }

    fn dispatch(&mut self, what: &str, mut call: impl FnMut(&mut dyn Reporter) -> Result<(), ReporterError>) {
        let mut failures: Vec<(usize, ReporterError)> = Vec::new();
        for (index, reporter) in self.reporters.iter_mut().enumerate() {
            if let Err(error) = call(reporter.as_mut()) {
                tracing::warn!(reporter = index, callback = what, %error, "reporter error");
                failures.push((index, error));
            }
        }
        // Surface each failure to the other reporters. Errors raised while
        // reporting an error are logged and dropped.
        for (source, error) in failures {
            let serialized =
                SerializedError::from_message(format!("reporter {source} failed in {what}: {error}"));
            for (index, reporter) in self.reporters.iter_mut().enumerate() {
                if index == source {
                    continue;
                }
                if let Err(error) = reporter.on_error(&serialized) {
                    tracing::warn!(reporter = index, %error, "reporter error while reporting error");
                }
            }
        }
    }

    pub(crate) fn on_begin(&mut self, config: &RunConfig, plan: &TestPlan) {
        self.dispatch("on_begin", |r| r.on_begin(config, plan));
    }

    pub(crate) fn on_test_begin(&mut self, test: &Test) {
        self.dispatch("on_test_begin", |r| r.on_test_begin(test));
    }

    pub(crate) fn on_std_out(&mut self, test: Option<&Test>, chunk: &[u8]) {
        self.dispatch("on_std_out", |r| r.on_std_out(test, chunk));
    }

    pub(crate) fn on_std_err(&mut self, test: Option<&Test>, chunk: &[u8]) {
        self.dispatch("on_std_err", |r| r.on_std_err(test, chunk));
    }

    pub(crate) fn on_test_end(&mut self, test: &Test, result: &TestResult) {
        self.dispatch("on_test_end", |r| r.on_test_end(test, result));
    }

    pub(crate) fn on_error(&mut self, error: &SerializedError) {
        self.dispatch("on_error", |r| r.on_error(error));
    }

    pub(crate) fn on_timeout(&mut self, stats: &RunStats) {
        self.dispatch("on_timeout", |r| r.on_timeout(stats));
    }

    pub(crate) fn on_end(&mut self, stats: &RunStats) {
        self.dispatch("on_end", |r| r.on_end(stats));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Record {
        calls: Arc<Mutex<Vec<String>>>,
    }

    struct Failing {
        record: Record,
    }

    impl Reporter for Failing {
        fn on_end(&mut self, _stats: &RunStats) -> Result<(), ReporterError> {
            self.record.calls.lock().unwrap().push("failing:on_end".into());
            Err("disk full".into())
        }
    }

    struct Healthy {
        record: Record,
    }

    impl Reporter for Healthy {
        fn on_end(&mut self, _stats: &RunStats) -> Result<(), ReporterError> {
            self.record.calls.lock().unwrap().push("healthy:on_end".into());
            Ok(())
        }

        fn on_error(&mut self, error: &SerializedError) -> Result<(), ReporterError> {
            self.record
                .calls
                .lock()
                .unwrap()
                .push(format!("healthy:on_error:{}", error.message));
            Ok(())
        }
    }

    #[test]
    fn reporter_errors_are_swallowed_and_rerouted() {
        let record = Record::default();
        let mut mux = ReporterMux::new(vec![
            Box::new(Failing {
                record: record.clone(),
            }),
            Box::new(Healthy {
                record: record.clone(),
            }),
        ]);

        mux.on_end(&RunStats::default());

        let calls = record.calls.lock().unwrap();
        assert_eq!(calls[0], "failing:on_end");
        assert_eq!(calls[1], "healthy:on_end");
        assert!(
            calls[2].starts_with("healthy:on_error:reporter 0 failed in on_end"),
            "error routed to the healthy reporter: {}",
            calls[2]
        );
    }
}
