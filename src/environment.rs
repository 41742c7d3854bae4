// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! User-defined environments and their composition.
//!
//! An environment wraps every test run by a worker: `before_all` once per
//! worker, `before_each`/`after_each` around each attempt, `after_all` at
//! worker shutdown. When a project composes several environments, `before*`
//! callbacks run in composition order and `after*` callbacks in reverse;
//! argument bags returned by later `before_each` callbacks shallow-merge
//! over earlier ones.

use crate::model::{ArgMap, SerializedError, TestInfo, UserError, WorkerInfo};
use async_trait::async_trait;
use std::sync::Arc;

/// A user-defined environment, resolved by name from the registry.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Worker scope; invoked once per worker before the first test. A
    /// returned argument bag is merged into every test's arguments.
    async fn before_all(&self, info: &WorkerInfo) -> Result<Option<ArgMap>, UserError> {
        let _ = info;
        Ok(None)
    }

    /// Test scope; invoked before each attempt. A returned argument bag is
    /// merged into the attempt's arguments.
    async fn before_each(&self, info: &TestInfo) -> Result<Option<ArgMap>, UserError> {
        let _ = info;
        Ok(None)
    }

    /// Test scope; invoked after each attempt, in reverse composition order.
    async fn after_each(&self, info: &TestInfo) -> Result<(), UserError> {
        let _ = info;
        Ok(())
    }

    /// Worker scope; invoked at worker shutdown, in reverse composition
    /// order, for every environment whose `before_all` ran.
    async fn after_all(&self, info: &WorkerInfo) -> Result<(), UserError> {
        let _ = info;
        Ok(())
    }
}

/// Shallow-merges `overlay` over `base`: later keys win.
pub(crate) fn merge_args(base: &mut ArgMap, overlay: ArgMap) {
    for (key, value) in overlay {
        base.insert(key, value);
    }
}

/// The ordered environments composed around one worker's tests.
pub(crate) struct EnvironmentStack {
    environments: Vec<(String, Arc<dyn Environment>)>,
    /// Arguments accumulated from `before_all` callbacks.
    worker_args: ArgMap,
    /// How many environments completed `before_all`; `after_all` unwinds
    /// exactly these.
    initialized: usize,
}

impl EnvironmentStack {
    pub(crate) fn new(environments: Vec<(String, Arc<dyn Environment>)>) -> Self {
        Self {
            environments,
            worker_args: ArgMap::new(),
            initialized: 0,
        }
    }

    pub(crate) fn worker_args(&self) -> &ArgMap {
        &self.worker_args
    }

    /// Runs every `before_all` in composition order. The first failure stops
    /// the walk; already-initialized environments remain due for teardown.
    pub(crate) async fn before_all(&mut self, info: &WorkerInfo) -> Result<(), SerializedError> {
        for (name, environment) in &self.environments[self.initialized..] {
            match environment.before_all(info).await {
                Ok(args) => {
                    self.initialized += 1;
                    if let Some(args) = args {
                        merge_args(&mut self.worker_args, args);
                    }
                }
                Err(error) => {
                    tracing::debug!(environment = %name, "environment before_all failed");
                    return Err(SerializedError::from_user_error(&error));
                }
            }
        }
        Ok(())
    }

    /// Runs every `before_each` in composition order, merging returned
    /// argument bags over `args`. The first failure short-circuits.
    pub(crate) async fn before_each(
        &self,
        info: &TestInfo,
        args: &mut ArgMap,
    ) -> Result<(), UserError> {
        for (_, environment) in &self.environments {
            if let Some(overlay) = environment.before_each(info).await? {
                merge_args(args, overlay);
            }
        }
        Ok(())
    }

    /// Runs every `after_each` in reverse order. Every callback runs; the
    /// first error is preserved.
    pub(crate) async fn after_each(&self, info: &TestInfo) -> Result<(), UserError> {
        let mut first_error = None;
        for (name, environment) in self.environments.iter().rev() {
            if let Err(error) = environment.after_each(info).await {
                tracing::debug!(environment = %name, "environment after_each failed");
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Runs `after_all` in reverse order for every environment whose
    /// `before_all` ran. Errors are collected, not propagated.
    pub(crate) async fn after_all(&mut self, info: &WorkerInfo) -> Vec<SerializedError> {
        let mut errors = Vec::new();
        for (name, environment) in self.environments[..self.initialized].iter().rev() {
            if let Err(error) = environment.after_all(info).await {
                tracing::debug!(environment = %name, "environment after_all failed");
                errors.push(SerializedError::from_user_error(&error));
            }
        }
        self.initialized = 0;
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Project,
        model::{TestId, TestStatus},
    };
    use camino::Utf8PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingEnv {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_before_each: bool,
    }

    #[async_trait]
    impl Environment for RecordingEnv {
        async fn before_all(&self, _info: &WorkerInfo) -> Result<Option<ArgMap>, UserError> {
            self.log.lock().unwrap().push(format!("{}:before_all", self.name));
            let mut args = ArgMap::new();
            args.insert("origin".to_owned(), self.name.into());
            args.insert(format!("{}_ready", self.name), true.into());
            Ok(Some(args))
        }

        async fn before_each(&self, _info: &TestInfo) -> Result<Option<ArgMap>, UserError> {
            self.log.lock().unwrap().push(format!("{}:before_each", self.name));
            if self.fail_before_each {
                return Err(UserError::fail("before_each boom"));
            }
            Ok(None)
        }

        async fn after_each(&self, _info: &TestInfo) -> Result<(), UserError> {
            self.log.lock().unwrap().push(format!("{}:after_each", self.name));
            Ok(())
        }

        async fn after_all(&self, _info: &WorkerInfo) -> Result<(), UserError> {
            self.log.lock().unwrap().push(format!("{}:after_all", self.name));
            Ok(())
        }
    }

    fn worker_info() -> WorkerInfo {
        WorkerInfo {
            worker_index: 0,
            project: Project::new("default"),
            variation: ArgMap::new(),
        }
    }

    fn test_info() -> TestInfo {
        TestInfo::new(
            TestId("0".repeat(16)),
            Project::new("default"),
            Utf8PathBuf::from("tests/a.rs"),
            vec!["spec".to_owned()],
            0,
            0,
            0,
            TestStatus::Passed,
            Vec::new(),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn composition_is_forward_then_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = EnvironmentStack::new(vec![
            (
                "db".to_owned(),
                Arc::new(RecordingEnv {
                    name: "db",
                    log: log.clone(),
                    fail_before_each: false,
                }) as Arc<dyn Environment>,
            ),
            (
                "server".to_owned(),
                Arc::new(RecordingEnv {
                    name: "server",
                    log: log.clone(),
                    fail_before_each: false,
                }) as Arc<dyn Environment>,
            ),
        ]);

        let winfo = worker_info();
        let tinfo = test_info();
        stack.before_all(&winfo).await.unwrap();
        let mut args = ArgMap::new();
        stack.before_each(&tinfo, &mut args).await.unwrap();
        stack.after_each(&tinfo).await.unwrap();
        assert!(stack.after_all(&winfo).await.is_empty());

        assert_eq!(
            log.lock().unwrap().as_slice(),
            [
                "db:before_all",
                "server:before_all",
                "db:before_each",
                "server:before_each",
                "server:after_each",
                "db:after_each",
                "server:after_all",
                "db:after_all",
            ]
        );

        // Later before_all results shallow-merge over earlier ones.
        assert_eq!(stack.worker_args()["origin"], "server");
        assert_eq!(stack.worker_args()["db_ready"], true);
        assert_eq!(stack.worker_args()["server_ready"], true);
    }

    #[tokio::test]
    async fn before_each_failure_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stack = EnvironmentStack::new(vec![
            (
                "first".to_owned(),
                Arc::new(RecordingEnv {
                    name: "first",
                    log: log.clone(),
                    fail_before_each: true,
                }) as Arc<dyn Environment>,
            ),
            (
                "second".to_owned(),
                Arc::new(RecordingEnv {
                    name: "second",
                    log: log.clone(),
                    fail_before_each: false,
                }) as Arc<dyn Environment>,
            ),
        ]);

        let tinfo = test_info();
        let mut args = ArgMap::new();
        let err = stack.before_each(&tinfo, &mut args).await.unwrap_err();
        assert_eq!(err.to_string(), "before_each boom");
        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["first:before_each"],
            "second environment never starts"
        );
    }
}
