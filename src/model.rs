// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The entity model for a test run.
//!
//! Everything here is immutable after construction, with one deliberate
//! exception: [`TestInfo`], the mutable scratch handed to user hooks and test
//! bodies for the duration of a single attempt.

use crate::config::Project;
use camino::{Utf8Path, Utf8PathBuf};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};
use xxhash_rust::xxh64::xxh64;

/// A JSON argument bag, as produced by variations and environments.
pub type ArgMap = serde_json::Map<String, serde_json::Value>;

/// The final status of one test attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestStatus {
    /// The attempt completed without error.
    Passed,
    /// The attempt failed with an error.
    Failed,
    /// The attempt exceeded its deadline.
    TimedOut,
    /// The attempt was skipped, statically or dynamically.
    Skipped,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::TimedOut => "timedOut",
            TestStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// The kind of a static or dynamic annotation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnnotationKind {
    /// Do not run the test; report it as skipped.
    Skip,
    /// Like `Skip`, but marks a known defect.
    Fixme,
    /// The test is expected to fail.
    Fail,
    /// The test is slow; its deadline is tripled.
    Slow,
}

/// An annotation attached to a suite or spec, or added dynamically via
/// [`TestInfo`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// The annotation kind.
    #[serde(rename = "type")]
    pub kind: AnnotationKind,
    /// An optional human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Annotation {
    /// Creates a new annotation.
    pub fn new(kind: AnnotationKind, description: Option<String>) -> Self {
        Self { kind, description }
    }
}

/// A file/line pair identifying where an entity was declared.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    /// The source file.
    pub file: Utf8PathBuf,
    /// The 1-based line number.
    pub line: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// An error produced by user code: a test body, a hook, or an environment
/// callback.
///
/// The [`Skip`](UserError::Skip) variant is the skip marker: returning it
/// from a body transitions the attempt to [`TestStatus::Skipped`] instead of
/// failing it.
#[derive(Clone, Debug)]
pub enum UserError {
    /// A failure with a message.
    Fail {
        /// The failure message.
        message: String,
    },
    /// A failure whose payload was not an error (serialized verbatim).
    Value {
        /// The non-error payload.
        value: serde_json::Value,
    },
    /// The skip marker.
    Skip {
        /// An optional reason.
        reason: Option<String>,
    },
}

impl UserError {
    /// Creates a failure from a message.
    pub fn fail(message: impl Into<String>) -> Self {
        UserError::Fail {
            message: message.into(),
        }
    }

    /// Creates the skip marker.
    pub fn skip(reason: impl Into<Option<String>>) -> Self {
        UserError::Skip {
            reason: reason.into(),
        }
    }

    /// Returns true if this is the skip marker.
    pub fn is_skip(&self) -> bool {
        matches!(self, UserError::Skip { .. })
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UserError::Fail { message } => f.write_str(message),
            UserError::Value { value } => write!(f, "{value}"),
            UserError::Skip { reason } => match reason {
                Some(reason) => write!(f, "skipped: {reason}"),
                None => f.write_str("skipped"),
            },
        }
    }
}

impl std::error::Error for UserError {}

impl From<String> for UserError {
    fn from(message: String) -> Self {
        UserError::Fail { message }
    }
}

impl From<&str> for UserError {
    fn from(message: &str) -> Self {
        UserError::fail(message)
    }
}

/// The canonical serialized form of an error crossing the process boundary.
///
/// `value` is populated when the failure payload was not an error (a
/// non-string panic payload, or [`UserError::Value`]).
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedError {
    /// The error message.
    pub message: String,
    /// A backtrace or location trail, if one was captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// The stringified non-error payload, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl SerializedError {
    /// Creates a serialized error from a message.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            value: None,
        }
    }

    pub(crate) fn from_user_error(error: &UserError) -> Self {
        match error {
            UserError::Fail { message } => Self::from_message(message.clone()),
            UserError::Value { value } => Self {
                message: value.to_string(),
                stack: None,
                value: Some(value.clone()),
            },
            UserError::Skip { reason } => {
                Self::from_message(reason.clone().unwrap_or_else(|| "skipped".to_owned()))
            }
        }
    }

    /// Renders a panic payload into the canonical shape.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        if let Some(message) = payload.downcast_ref::<&str>() {
            Self::from_message(*message)
        } else if let Some(message) = payload.downcast_ref::<String>() {
            Self::from_message(message.clone())
        } else {
            Self {
                message: "panic with non-string payload".to_owned(),
                stack: None,
                value: Some(serde_json::Value::String("<non-string panic>".to_owned())),
            }
        }
    }
}

/// The asynchronous body of a spec or a per-test hook.
///
/// Bodies receive the resolved argument bag and the attempt's [`TestInfo`].
pub type TestFn = Arc<
    dyn Fn(ArgMap, Arc<TestInfo>) -> BoxFuture<'static, Result<(), UserError>> + Send + Sync,
>;

/// A worker-scoped hook (`before_all` / `after_all`).
pub type SuiteFn =
    Arc<dyn Fn(Arc<WorkerInfo>) -> BoxFuture<'static, Result<(), UserError>> + Send + Sync>;

/// A suite: a titled, ordered grouping of child suites and specs, with hooks
/// and annotations that apply to every descendant spec.
#[derive(Clone)]
pub struct Suite {
    /// The suite title. Empty for a file's root suite.
    pub title: String,
    /// Where the suite was declared.
    pub location: SourceLocation,
    /// Whether the suite carries an `only` marker.
    pub only: bool,
    /// Static annotations, inherited by every descendant spec.
    pub annotations: Vec<Annotation>,
    /// Ordered children.
    pub children: Vec<SuiteChild>,
    /// Hooks run once per worker scope, outermost-first.
    pub before_all: Vec<SuiteFn>,
    /// Hooks run once per worker scope, innermost-first.
    pub after_all: Vec<SuiteFn>,
    /// Hooks run before every descendant spec, outermost-first.
    pub before_each: Vec<TestFn>,
    /// Hooks run after every descendant spec, innermost-first.
    pub after_each: Vec<TestFn>,
}

impl fmt::Debug for Suite {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Suite")
            .field("title", &self.title)
            .field("location", &self.location)
            .field("only", &self.only)
            .field("annotations", &self.annotations)
            .field("children", &self.children)
            .field("before_all", &self.before_all.len())
            .field("after_all", &self.after_all.len())
            .field("before_each", &self.before_each.len())
            .field("after_each", &self.after_each.len())
            .finish()
    }
}

impl Suite {
    pub(crate) fn new(title: impl Into<String>, location: SourceLocation) -> Self {
        Self {
            title: title.into(),
            location,
            only: false,
            annotations: Vec::new(),
            children: Vec::new(),
            before_all: Vec::new(),
            after_all: Vec::new(),
            before_each: Vec::new(),
            after_each: Vec::new(),
        }
    }

    /// Returns true if any descendant suite or spec carries an `only` marker.
    pub fn contains_only(&self) -> bool {
        self.children.iter().any(|child| match child {
            SuiteChild::Suite(suite) => suite.only || suite.contains_only(),
            SuiteChild::Spec(spec) => spec.only,
        })
    }
}

/// An ordered child of a suite.
#[derive(Clone, Debug)]
pub enum SuiteChild {
    /// A nested suite.
    Suite(Suite),
    /// A spec.
    Spec(Spec),
}

/// A single declared test case.
#[derive(Clone)]
pub struct Spec {
    /// The spec title.
    pub title: String,
    /// Where the spec was declared.
    pub location: SourceLocation,
    /// Whether the spec carries an `only` marker.
    pub only: bool,
    /// Static annotations.
    pub annotations: Vec<Annotation>,
    /// A per-spec timeout override.
    pub timeout: Option<Duration>,
    /// The test body.
    pub body: TestFn,
}

impl fmt::Debug for Spec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Spec")
            .field("title", &self.title)
            .field("location", &self.location)
            .field("only", &self.only)
            .field("annotations", &self.annotations)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// The root suite for one test file, produced by that file's describe pass.
#[derive(Clone, Debug)]
pub struct FileSuite {
    /// The test file this suite was loaded from.
    pub file: Utf8PathBuf,
    /// The root suite. Its title is empty and it carries no location of its
    /// own beyond the file.
    pub suite: Suite,
}

/// A stable identifier for a scheduled test.
///
/// Derived deterministically from the file path, the spec's ordinal within
/// the file, the variation string and the repeat index, so it is unique
/// across the run and stable across invocations given the same inputs.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(pub String);

impl TestId {
    pub(crate) fn compute(
        file: &Utf8Path,
        ordinal: usize,
        variation_string: &str,
        repeat_index: u32,
    ) -> Self {
        let input = format!("{file}\u{0}{ordinal}\u{0}{variation_string}\u{0}{repeat_index}");
        TestId(format!("{:016x}", xxh64(input.as_bytes(), 0)))
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The unit the dispatcher schedules: one spec under one variation and one
/// repeat index.
#[derive(Clone, Debug)]
pub struct Test {
    /// The stable test id.
    pub id: TestId,
    /// The owning project's name.
    pub project: String,
    /// The test file.
    pub file: Utf8PathBuf,
    /// The spec's ordinal within the file (declaration order).
    pub ordinal: usize,
    /// Ancestor suite titles followed by the spec title. Empty titles (the
    /// file root) are omitted.
    pub titles: Vec<String>,
    /// Where the spec was declared.
    pub location: SourceLocation,
    /// Annotations inherited from ancestor suites plus the spec's own.
    pub annotations: Vec<Annotation>,
    /// The outcome that counts as success for this test.
    pub expected_status: TestStatus,
    /// The per-attempt deadline.
    pub timeout: Duration,
    /// How many retries the test is allowed.
    pub retries: u32,
    /// The repeat index, `0..repeat_each`.
    pub repeat_index: u32,
    /// The worker variation this test runs under.
    pub variation: ArgMap,
    /// The canonical string form of the variation.
    pub variation_string: String,
}

impl Test {
    /// The full, space-joined title.
    pub fn full_title(&self) -> String {
        self.titles.join(" ")
    }

    /// The hash of this test's variation, used for worker-affinity bucketing.
    pub fn variation_hash(&self) -> u64 {
        xxh64(self.variation_string.as_bytes(), 0)
    }
}

/// Computes the expected status from the inherited annotation chain.
///
/// `skip`/`fixme` win over `fail`; anything else is expected to pass.
pub(crate) fn expected_status(annotations: &[Annotation]) -> TestStatus {
    if annotations
        .iter()
        .any(|a| matches!(a.kind, AnnotationKind::Skip | AnnotationKind::Fixme))
    {
        TestStatus::Skipped
    } else if annotations
        .iter()
        .any(|a| matches!(a.kind, AnnotationKind::Fail))
    {
        TestStatus::Failed
    } else {
        TestStatus::Passed
    }
}

/// The result of one attempt of one test.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    /// The attempt number; 0 is the first run.
    pub retry: u32,
    /// The worker slot that ran the attempt, or `None` if it never ran.
    pub worker_index: Option<usize>,
    /// How long the attempt took.
    #[serde(with = "crate::config::duration_millis")]
    pub duration: Duration,
    /// The final status.
    pub status: TestStatus,
    /// The serialized error, for failed and timed-out attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
    /// Captured stdout fragments, in emission order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stdout: Vec<Vec<u8>>,
    /// Captured stderr fragments, in emission order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stderr: Vec<Vec<u8>>,
    /// User-attached data.
    #[serde(default, skip_serializing_if = "ArgMap::is_empty")]
    pub data: ArgMap,
    /// Annotations effective for the attempt, including dynamic ones.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
}

/// Worker-scoped information passed to `before_all`/`after_all` hooks and
/// environment worker callbacks.
#[derive(Clone, Debug)]
pub struct WorkerInfo {
    /// The worker slot index.
    pub worker_index: usize,
    /// The project this worker is currently serving.
    pub project: Project,
    /// The worker variation.
    pub variation: ArgMap,
}

/// Mutable per-attempt scratch passed to user hooks and test bodies.
///
/// Created immediately before `before_each`, discarded after the
/// environment's `after_each` completes.
pub struct TestInfo {
    /// The test id.
    pub test_id: TestId,
    /// The owning project.
    pub project: Project,
    /// The test file.
    pub file: Utf8PathBuf,
    /// Ancestor suite titles followed by the spec title.
    pub titles: Vec<String>,
    /// The attempt number.
    pub retry: u32,
    /// The repeat index.
    pub repeat_index: u32,
    /// The worker slot index.
    pub worker_index: usize,
    state: Mutex<TestInfoState>,
}

#[derive(Debug)]
struct TestInfoState {
    expected_status: TestStatus,
    timeout: Duration,
    annotations: Vec<Annotation>,
    data: ArgMap,
}

impl fmt::Debug for TestInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TestInfo")
            .field("test_id", &self.test_id)
            .field("titles", &self.titles)
            .field("retry", &self.retry)
            .field("repeat_index", &self.repeat_index)
            .field("worker_index", &self.worker_index)
            .finish()
    }
}

impl TestInfo {
    pub(crate) fn new(
        test_id: TestId,
        project: Project,
        file: Utf8PathBuf,
        titles: Vec<String>,
        retry: u32,
        repeat_index: u32,
        worker_index: usize,
        expected_status: TestStatus,
        annotations: Vec<Annotation>,
        timeout: Duration,
    ) -> Self {
        Self {
            test_id,
            project,
            file,
            titles,
            retry,
            repeat_index,
            worker_index,
            state: Mutex::new(TestInfoState {
                expected_status,
                timeout,
                annotations,
                data: ArgMap::new(),
            }),
        }
    }

    /// The full, space-joined title.
    pub fn full_title(&self) -> String {
        self.titles.join(" ")
    }

    /// The outcome currently expected for this attempt.
    pub fn expected_status(&self) -> TestStatus {
        self.state.lock().unwrap().expected_status
    }

    /// The effective deadline for this attempt.
    pub fn timeout(&self) -> Duration {
        self.state.lock().unwrap().timeout
    }

    /// Overrides the attempt's deadline. Phases that have not started yet
    /// race against the new value.
    pub fn set_timeout(&self, timeout: Duration) {
        self.state.lock().unwrap().timeout = timeout;
    }

    /// Marks the attempt slow, tripling the remaining deadline.
    pub fn slow(&self) {
        let mut state = self.state.lock().unwrap();
        state.timeout *= 3;
        state
            .annotations
            .push(Annotation::new(AnnotationKind::Slow, None));
    }

    /// Dynamically skips the attempt. Return the marker from the body:
    ///
    /// ```ignore
    /// return Err(info.skip(Some("not supported here".to_owned())));
    /// ```
    pub fn skip(&self, reason: Option<String>) -> UserError {
        self.state
            .lock()
            .unwrap()
            .annotations
            .push(Annotation::new(AnnotationKind::Skip, reason.clone()));
        UserError::Skip { reason }
    }

    /// Dynamically marks the attempt as a known defect and skips it.
    pub fn fixme(&self, reason: Option<String>) -> UserError {
        self.state
            .lock()
            .unwrap()
            .annotations
            .push(Annotation::new(AnnotationKind::Fixme, reason.clone()));
        UserError::Skip { reason }
    }

    /// Dynamically marks the attempt as expected to fail.
    pub fn fail(&self, reason: Option<String>) {
        let mut state = self.state.lock().unwrap();
        state.expected_status = TestStatus::Failed;
        state
            .annotations
            .push(Annotation::new(AnnotationKind::Fail, reason));
    }

    /// Attaches a key/value pair to the attempt's result.
    pub fn set_data(&self, key: impl Into<String>, value: serde_json::Value) {
        self.state.lock().unwrap().data.insert(key.into(), value);
    }

    pub(crate) fn annotations(&self) -> Vec<Annotation> {
        self.state.lock().unwrap().annotations.clone()
    }

    pub(crate) fn data(&self) -> ArgMap {
        self.state.lock().unwrap().data.clone()
    }

    /// Computes a path under the attempt's output directory, unique across
    /// attempts and repeats. The directory is created lazily on first use.
    pub fn output_path(&self, name: &str) -> std::io::Result<Utf8PathBuf> {
        let dir = crate::worker::paths::output_dir(
            &self.project,
            &self.file,
            &self.titles,
            self.retry,
            self.repeat_index,
        );
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join(name))
    }

    /// Computes a path under the test's snapshot directory. Snapshot paths
    /// exclude retry/repeat suffixes: snapshots are shared across attempts.
    pub fn snapshot_path(&self, name: &str) -> Utf8PathBuf {
        crate::worker::paths::snapshot_dir(&self.project, &self.file, &self.titles).join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_stable_and_input_sensitive() {
        let file = Utf8Path::new("tests/login.rs");
        let a = TestId::compute(file, 0, "{}", 0);
        let b = TestId::compute(file, 0, "{}", 0);
        assert_eq!(a, b, "same inputs produce the same id");

        assert_ne!(a, TestId::compute(file, 1, "{}", 0));
        assert_ne!(a, TestId::compute(file, 0, "{\"browser\":\"webkit\"}", 0));
        assert_ne!(a, TestId::compute(file, 0, "{}", 1));
        assert_ne!(a, TestId::compute(Utf8Path::new("tests/logout.rs"), 0, "{}", 0));
    }

    #[test]
    fn expected_status_precedence() {
        let skip = Annotation::new(AnnotationKind::Skip, None);
        let fail = Annotation::new(AnnotationKind::Fail, None);
        let slow = Annotation::new(AnnotationKind::Slow, None);

        assert_eq!(expected_status(&[]), TestStatus::Passed);
        assert_eq!(expected_status(&[slow.clone()]), TestStatus::Passed);
        assert_eq!(expected_status(&[fail.clone()]), TestStatus::Failed);
        assert_eq!(
            expected_status(&[fail.clone(), skip.clone()]),
            TestStatus::Skipped,
            "skip wins over fail"
        );
        assert_eq!(
            expected_status(&[Annotation::new(AnnotationKind::Fixme, None)]),
            TestStatus::Skipped
        );
        assert_eq!(expected_status(&[slow, fail]), TestStatus::Failed);
    }

    #[test]
    fn dynamic_modifiers() {
        let info = TestInfo::new(
            TestId("0123456789abcdef".to_owned()),
            Project::new("default"),
            Utf8PathBuf::from("tests/a.rs"),
            vec!["suite".to_owned(), "spec".to_owned()],
            0,
            0,
            0,
            TestStatus::Passed,
            Vec::new(),
            Duration::from_secs(30),
        );

        info.slow();
        assert_eq!(info.timeout(), Duration::from_secs(90));

        info.set_timeout(Duration::from_secs(5));
        assert_eq!(info.timeout(), Duration::from_secs(5));

        let marker = info.skip(Some("flaky on CI".to_owned()));
        assert!(marker.is_skip());

        info.fail(None);
        assert_eq!(info.expected_status(), TestStatus::Failed);

        let annotations = info.annotations();
        assert_eq!(annotations.len(), 3);
        assert_eq!(annotations[0].kind, AnnotationKind::Slow);
        assert_eq!(annotations[1].kind, AnnotationKind::Skip);
        assert_eq!(annotations[2].kind, AnnotationKind::Fail);
    }
}
