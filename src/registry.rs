// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The registry of test files and environments.
//!
//! Test declaration is a two-phase contract: the front end's transform
//! registers one *describe* function per test file, and the planner and the
//! workers each run that function to obtain the file's [`FileSuite`]. The
//! describe pass must be deterministic: both sides rely on declaration order
//! to agree on test identity.

use crate::{
    environment::Environment,
    errors::FileLoadError,
    model::{
        Annotation, AnnotationKind, ArgMap, FileSuite, SourceLocation, Spec, Suite, SuiteChild,
        TestInfo, UserError, WorkerInfo,
    },
};
use camino::{Utf8Path, Utf8PathBuf};
use futures::FutureExt;
use std::{collections::BTreeMap, fmt, future::Future, panic::AssertUnwindSafe, sync::Arc};

type DescribeFn = Arc<dyn Fn(&mut SuiteBuilder) + Send + Sync>;

/// One registered test file.
#[derive(Clone)]
pub struct RegisteredFile {
    /// The file path, relative to the workspace root.
    pub path: Utf8PathBuf,
    describe: DescribeFn,
}

impl fmt::Debug for RegisteredFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RegisteredFile")
            .field("path", &self.path)
            .finish()
    }
}

/// The registry of test files and named environments for a run.
///
/// Both the parent and every worker hold the same registry; the worker's
/// copy is what makes file loading and environment resolution possible in
/// the child process.
#[derive(Clone, Default)]
pub struct TestFileRegistry {
    files: Vec<RegisteredFile>,
    environments: BTreeMap<String, Arc<dyn Environment>>,
}

impl fmt::Debug for TestFileRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TestFileRegistry")
            .field("files", &self.files)
            .field("environments", &self.environments.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TestFileRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a test file with its describe function.
    pub fn register_file(
        &mut self,
        path: impl Into<Utf8PathBuf>,
        describe: impl Fn(&mut SuiteBuilder) + Send + Sync + 'static,
    ) -> &mut Self {
        self.files.push(RegisteredFile {
            path: path.into(),
            describe: Arc::new(describe),
        });
        self
    }

    /// Registers a named environment.
    pub fn register_environment(
        &mut self,
        name: impl Into<String>,
        environment: impl Environment + 'static,
    ) -> &mut Self {
        self.environments
            .insert(name.into(), Arc::new(environment));
        self
    }

    /// The registered files, in registration order.
    pub fn files(&self) -> &[RegisteredFile] {
        &self.files
    }

    /// Looks up an environment by name.
    pub fn environment(&self, name: &str) -> Option<Arc<dyn Environment>> {
        self.environments.get(name).cloned()
    }

    /// Runs the describe pass for one file, producing its suite tree.
    ///
    /// A panicking describe function is a load error, not a crash: it is
    /// reported as a fatal error for the file's bucket.
    pub fn load(&self, path: &Utf8Path) -> Result<FileSuite, FileLoadError> {
        let file = self
            .files
            .iter()
            .find(|f| f.path == path)
            .ok_or(FileLoadError::NotRegistered)?;

        let mut builder = SuiteBuilder::new(file.path.clone());
        let describe = &file.describe;
        std::panic::catch_unwind(AssertUnwindSafe(|| describe(&mut builder))).map_err(
            |payload| FileLoadError::DescribePanic {
                message: crate::model::SerializedError::from_panic(payload).message,
            },
        )?;
        Ok(builder.finish())
    }
}

/// Builder passed to a file's describe function.
///
/// Maintains a stack of open suites; declaration calls append to the
/// innermost one. Call-site locations are captured automatically.
pub struct SuiteBuilder {
    file: Utf8PathBuf,
    stack: Vec<Suite>,
}

impl SuiteBuilder {
    pub(crate) fn new(file: Utf8PathBuf) -> Self {
        let root = Suite::new(
            "",
            SourceLocation {
                file: file.clone(),
                line: 0,
            },
        );
        Self {
            file,
            stack: vec![root],
        }
    }

    #[track_caller]
    fn caller_location(&self) -> SourceLocation {
        let caller = std::panic::Location::caller();
        SourceLocation {
            file: self.file.clone(),
            line: caller.line(),
        }
    }

    fn current(&mut self) -> &mut Suite {
        self.stack.last_mut().expect("suite stack is never empty")
    }

    #[track_caller]
    fn push_suite(&mut self, title: &str, only: bool, f: impl FnOnce(&mut SuiteBuilder)) {
        let location = self.caller_location();
        let mut suite = Suite::new(title, location);
        suite.only = only;
        self.stack.push(suite);
        f(self);
        let suite = self.stack.pop().expect("pushed suite is still on the stack");
        self.current().children.push(SuiteChild::Suite(suite));
    }

    /// Declares a nested suite.
    #[track_caller]
    pub fn suite(&mut self, title: &str, f: impl FnOnce(&mut SuiteBuilder)) {
        self.push_suite(title, false, f);
    }

    /// Declares a nested suite carrying the `only` marker.
    #[track_caller]
    pub fn suite_only(&mut self, title: &str, f: impl FnOnce(&mut SuiteBuilder)) {
        self.push_suite(title, true, f);
    }

    #[track_caller]
    fn push_spec<F, Fut>(&mut self, title: &str, only: bool, body: F)
    where
        F: Fn(ArgMap, Arc<TestInfo>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), UserError>> + Send + 'static,
    {
        let location = self.caller_location();
        let body = Arc::new(move |args, info| body(args, info).boxed());
        self.current().children.push(SuiteChild::Spec(Spec {
            title: title.to_owned(),
            location,
            only,
            annotations: Vec::new(),
            timeout: None,
            body,
        }));
    }

    /// Declares a spec.
    #[track_caller]
    pub fn spec<F, Fut>(&mut self, title: &str, body: F)
    where
        F: Fn(ArgMap, Arc<TestInfo>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), UserError>> + Send + 'static,
    {
        self.push_spec(title, false, body);
    }

    /// Declares a spec carrying the `only` marker.
    #[track_caller]
    pub fn spec_only<F, Fut>(&mut self, title: &str, body: F)
    where
        F: Fn(ArgMap, Arc<TestInfo>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), UserError>> + Send + 'static,
    {
        self.push_spec(title, true, body);
    }

    /// Annotates the enclosing suite. The annotation is inherited by every
    /// descendant spec.
    pub fn annotate(&mut self, kind: AnnotationKind, description: Option<&str>) {
        let annotation = Annotation::new(kind, description.map(str::to_owned));
        self.current().annotations.push(annotation);
    }

    /// Annotates the enclosing suite when `condition` holds. Conditions are
    /// evaluated here, at describe time.
    pub fn annotate_if(&mut self, condition: bool, kind: AnnotationKind, description: Option<&str>) {
        if condition {
            self.annotate(kind, description);
        }
    }

    /// Overrides the timeout of the most recently declared spec.
    pub fn set_spec_timeout(&mut self, timeout: std::time::Duration) {
        if let Some(SuiteChild::Spec(spec)) = self.current().children.last_mut() {
            spec.timeout = Some(timeout);
        }
    }

    /// Annotates the most recently declared spec.
    pub fn annotate_spec(&mut self, kind: AnnotationKind, description: Option<&str>) {
        let annotation = Annotation::new(kind, description.map(str::to_owned));
        if let Some(SuiteChild::Spec(spec)) = self.current().children.last_mut() {
            spec.annotations.push(annotation);
        }
    }

    /// Registers a `before_all` hook on the enclosing suite.
    pub fn before_all<F, Fut>(&mut self, hook: F)
    where
        F: Fn(Arc<WorkerInfo>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), UserError>> + Send + 'static,
    {
        self.current()
            .before_all
            .push(Arc::new(move |info| hook(info).boxed()));
    }

    /// Registers an `after_all` hook on the enclosing suite.
    pub fn after_all<F, Fut>(&mut self, hook: F)
    where
        F: Fn(Arc<WorkerInfo>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), UserError>> + Send + 'static,
    {
        self.current()
            .after_all
            .push(Arc::new(move |info| hook(info).boxed()));
    }

    /// Registers a `before_each` hook on the enclosing suite. Applies to
    /// every descendant spec, outermost-first.
    pub fn before_each<F, Fut>(&mut self, hook: F)
    where
        F: Fn(ArgMap, Arc<TestInfo>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), UserError>> + Send + 'static,
    {
        self.current()
            .before_each
            .push(Arc::new(move |args, info| hook(args, info).boxed()));
    }

    /// Registers an `after_each` hook on the enclosing suite. Applies to
    /// every descendant spec, innermost-first.
    pub fn after_each<F, Fut>(&mut self, hook: F)
    where
        F: Fn(ArgMap, Arc<TestInfo>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), UserError>> + Send + 'static,
    {
        self.current()
            .after_each
            .push(Arc::new(move |args, info| hook(args, info).boxed()));
    }

    fn finish(mut self) -> FileSuite {
        debug_assert_eq!(self.stack.len(), 1, "all suites closed");
        FileSuite {
            file: self.file,
            suite: self.stack.pop().expect("root suite present"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn describe_two_levels(b: &mut SuiteBuilder) {
        b.before_each(|_args, _info| async { Ok(()) });
        b.suite("login", |b| {
            b.spec("accepts valid credentials", |_args, _info| async { Ok(()) });
            b.spec_only("rejects bad passwords", |_args, _info| async { Ok(()) });
        });
        b.spec("root level", |_args, _info| async { Ok(()) });
    }

    #[test]
    fn load_builds_ordered_tree() {
        let mut registry = TestFileRegistry::new();
        registry.register_file("tests/login.rs", describe_two_levels);

        let file_suite = registry.load(Utf8Path::new("tests/login.rs")).unwrap();
        assert_eq!(file_suite.suite.children.len(), 2);
        assert_eq!(file_suite.suite.before_each.len(), 1);

        let SuiteChild::Suite(login) = &file_suite.suite.children[0] else {
            panic!("expected suite first");
        };
        assert_eq!(login.title, "login");
        assert_eq!(login.children.len(), 2);
        assert!(file_suite.suite.contains_only());

        let SuiteChild::Spec(root_spec) = &file_suite.suite.children[1] else {
            panic!("expected spec second");
        };
        assert_eq!(root_spec.title, "root level");
    }

    #[test]
    fn load_unregistered_file_fails() {
        let registry = TestFileRegistry::new();
        let err = registry.load(Utf8Path::new("tests/missing.rs")).unwrap_err();
        assert!(matches!(err, FileLoadError::NotRegistered));
    }

    #[test]
    fn panicking_describe_is_a_load_error() {
        let mut registry = TestFileRegistry::new();
        registry.register_file("tests/broken.rs", |_b: &mut SuiteBuilder| {
            panic!("bad declaration");
        });
        let err = registry.load(Utf8Path::new("tests/broken.rs")).unwrap_err();
        match err {
            FileLoadError::DescribePanic { message } => {
                assert_eq!(message, "bad declaration");
            }
            other => panic!("expected DescribePanic, got {other:?}"),
        }
    }
}
