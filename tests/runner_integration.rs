// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end runs through the planner, dispatcher and the real worker
//! runtime, with workers running in-process over duplex pipes.

use async_trait::async_trait;
use camino::Utf8PathBuf;
use std::sync::{Arc, Mutex};
use toreador_runner::{
    environment::Environment,
    errors::PlanError,
    model::{ArgMap, SerializedError, TestInfo, TestStatus, UserError, WorkerInfo},
    reporter::{events::CancelReason, Reporter, ReporterError},
    runner::WorkerMode,
    signal::SignalHandlerKind,
    Planner, Project, RunConfig, RunnerBuilder, SuiteBuilder, Test, TestFileRegistry, TestResult,
};

/// Records the reporter callback stream for ordering assertions.
#[derive(Default)]
struct RecordingReporter {
    lines: Arc<Mutex<Vec<String>>>,
}

impl Reporter for RecordingReporter {
    fn on_begin(
        &mut self,
        _config: &RunConfig,
        plan: &toreador_runner::TestPlan,
    ) -> Result<(), ReporterError> {
        self.lines
            .lock()
            .unwrap()
            .push(format!("begin {}", plan.test_count()));
        Ok(())
    }

    fn on_test_begin(&mut self, test: &Test) -> Result<(), ReporterError> {
        self.lines
            .lock()
            .unwrap()
            .push(format!("> {}", test.full_title()));
        Ok(())
    }

    fn on_test_end(&mut self, test: &Test, result: &TestResult) -> Result<(), ReporterError> {
        self.lines
            .lock()
            .unwrap()
            .push(format!("< {} {}", test.full_title(), result.status));
        Ok(())
    }

    fn on_error(&mut self, error: &SerializedError) -> Result<(), ReporterError> {
        self.lines
            .lock()
            .unwrap()
            .push(format!("error {}", error.message));
        Ok(())
    }

    fn on_timeout(
        &mut self,
        _stats: &toreador_runner::reporter::events::RunStats,
    ) -> Result<(), ReporterError> {
        self.lines.lock().unwrap().push("timeout".to_owned());
        Ok(())
    }

    fn on_end(
        &mut self,
        stats: &toreador_runner::reporter::events::RunStats,
    ) -> Result<(), ReporterError> {
        self.lines
            .lock()
            .unwrap()
            .push(format!("end {}", stats.exit_code()));
        Ok(())
    }
}

fn run(
    config: &RunConfig,
    registry: &TestFileRegistry,
) -> (toreador_runner::runner::RunReport, Vec<String>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let plan = Planner::new(config, registry).plan().unwrap();
    let reporter = RecordingReporter::default();
    let lines = reporter.lines.clone();

    let mut builder = RunnerBuilder::default();
    builder
        .set_signal_handler_kind(SignalHandlerKind::Noop)
        .set_worker_mode(WorkerMode::InProcess);
    let runner = builder.build(config, registry, &plan).unwrap();
    let report = runner.execute(vec![Box::new(reporter)]);

    let lines = lines.lock().unwrap().clone();
    (report, lines)
}

fn single_project_config(project: Project) -> RunConfig {
    let mut config = RunConfig::new(vec![project]);
    config.workers = 2;
    config
}

#[test]
fn flaky_test_retries_to_success() {
    let mut registry = TestFileRegistry::new();
    registry.register_file("tests/flaky.rs", |b: &mut SuiteBuilder| {
        b.spec("fails once", |_args: ArgMap, info: Arc<TestInfo>| async move {
            if info.retry == 0 {
                Err(UserError::fail("first attempt fails"))
            } else {
                Ok(())
            }
        });
    });
    let mut project = Project::new("default");
    project.retries = 2;
    let config = single_project_config(project);

    let (report, lines) = run(&config, &registry);

    let attempts = report.results.values().next().unwrap();
    assert_eq!(
        attempts.iter().map(|r| r.status).collect::<Vec<_>>(),
        [TestStatus::Failed, TestStatus::Passed],
        "one failed attempt, then a pass; retries stop at the first pass"
    );
    assert_eq!(report.stats.flaky, 1);
    assert_eq!(report.stats.failed, 0);
    assert_eq!(report.stats.exit_code(), 0);
    assert_eq!(lines.last().unwrap(), "end 0");
}

#[test]
fn timed_out_test_still_runs_its_after_each() {
    let marker_dir = camino_tempfile::tempdir().unwrap();
    let marker: Utf8PathBuf = marker_dir.path().join("teardown-ran");

    let mut registry = TestFileRegistry::new();
    {
        let marker = marker.clone();
        registry.register_file("tests/slow.rs", move |b: &mut SuiteBuilder| {
            let marker = marker.clone();
            b.after_each(move |_args: ArgMap, _info: Arc<TestInfo>| {
                let marker = marker.clone();
                async move {
                    std::fs::write(&marker, b"done").map_err(|e| UserError::fail(e.to_string()))
                }
            });
            b.spec("sleeps forever", |_args: ArgMap, _info: Arc<TestInfo>| async {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                Ok(())
            });
        });
    }
    let mut project = Project::new("default");
    project.timeout = std::time::Duration::from_millis(150);
    let config = single_project_config(project);

    let (report, _lines) = run(&config, &registry);

    let attempts = report.results.values().next().unwrap();
    assert_eq!(attempts[0].status, TestStatus::TimedOut);
    assert!(marker.exists(), "after_each ran despite the timeout");
    assert_eq!(report.stats.timed_out, 1);
    assert_eq!(report.stats.exit_code(), 1);
}

#[test]
fn forbid_only_fails_before_any_worker_exists() {
    let mut registry = TestFileRegistry::new();
    registry.register_file("tests/focused.rs", |b: &mut SuiteBuilder| {
        b.spec_only("focused", |_args: ArgMap, _info: Arc<TestInfo>| async { Ok(()) });
    });
    let mut config = RunConfig::new(vec![Project::new("default")]);
    config.forbid_only = true;

    let err = Planner::new(&config, &registry).plan().unwrap_err();
    let PlanError::OnlyMarkersForbidden { markers } = err else {
        panic!("expected the forbid-only outcome");
    };
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].title, "focused");
}

#[derive(Default)]
struct DbEnv {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Environment for DbEnv {
    async fn before_all(&self, info: &WorkerInfo) -> Result<Option<ArgMap>, UserError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("before_all w{}", info.worker_index));
        let mut args = ArgMap::new();
        args.insert("db_url".to_owned(), "postgres://localhost/test".into());
        Ok(Some(args))
    }

    async fn before_each(&self, _info: &TestInfo) -> Result<Option<ArgMap>, UserError> {
        let mut args = ArgMap::new();
        args.insert("tx_open".to_owned(), true.into());
        Ok(Some(args))
    }

    async fn after_all(&self, info: &WorkerInfo) -> Result<(), UserError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("after_all w{}", info.worker_index));
        Ok(())
    }
}

#[test]
fn environment_args_reach_the_test_body() {
    let env_log: Arc<Mutex<Vec<String>>> = Arc::default();
    let mut registry = TestFileRegistry::new();
    registry.register_environment(
        "db",
        DbEnv {
            log: env_log.clone(),
        },
    );
    registry.register_file("tests/db.rs", |b: &mut SuiteBuilder| {
        b.spec("sees env args", |args: ArgMap, _info: Arc<TestInfo>| async move {
            if args.get("db_url").is_none() {
                return Err(UserError::fail("db_url missing"));
            }
            if args.get("tx_open") != Some(&serde_json::Value::Bool(true)) {
                return Err(UserError::fail("tx_open missing"));
            }
            Ok(())
        });
    });
    let mut project = Project::new("default");
    project.use_environments = vec!["db".to_owned()];
    let mut config = single_project_config(project);
    config.workers = 1;

    let (report, _lines) = run(&config, &registry);
    assert_eq!(report.stats.passed, 1);
    assert_eq!(report.stats.exit_code(), 0);

    let env_log = env_log.lock().unwrap();
    assert_eq!(env_log.len(), 2, "one before_all and one after_all");
    assert!(env_log[0].starts_with("before_all"));
    assert!(env_log[1].starts_with("after_all"));
}

#[test]
fn expected_failure_passes_and_unexpected_pass_fails() {
    let mut registry = TestFileRegistry::new();
    registry.register_file("tests/expectations.rs", |b: &mut SuiteBuilder| {
        b.spec("known broken", |_args: ArgMap, _info: Arc<TestInfo>| async {
            Err(UserError::fail("still broken"))
        });
        b.annotate_spec(toreador_runner::model::AnnotationKind::Fail, Some("known"));
        b.spec("fixed but still marked", |_args: ArgMap, _info: Arc<TestInfo>| async {
            Ok(())
        });
        b.annotate_spec(toreador_runner::model::AnnotationKind::Fail, None);
    });
    let config = single_project_config(Project::new("default"));

    let (report, _lines) = run(&config, &registry);

    // The failing test with expected failure counts as passed; the passing
    // one marked as expected-to-fail is a failure ("passed unexpectedly").
    assert_eq!(report.stats.passed, 1);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.exit_code(), 1);
}

#[test]
fn repeat_each_produces_disjoint_output_dirs() {
    let out_root = camino_tempfile::tempdir().unwrap();
    let dirs: Arc<Mutex<Vec<Utf8PathBuf>>> = Arc::default();

    let mut registry = TestFileRegistry::new();
    {
        let dirs = dirs.clone();
        registry.register_file("tests/out.rs", move |b: &mut SuiteBuilder| {
            let dirs = dirs.clone();
            b.spec("writes output", move |_args: ArgMap, info: Arc<TestInfo>| {
                let dirs = dirs.clone();
                async move {
                    let path = info
                        .output_path("artifact.txt")
                        .map_err(|e| UserError::fail(e.to_string()))?;
                    std::fs::write(&path, info.repeat_index.to_string())
                        .map_err(|e| UserError::fail(e.to_string()))?;
                    dirs.lock().unwrap().push(path);
                    Ok(())
                }
            });
        });
    }
    let mut project = Project::new("default");
    project.repeat_each = 3;
    project.output_dir = out_root.path().to_path_buf();
    let mut config = single_project_config(project);
    config.workers = 2;

    let (report, _lines) = run(&config, &registry);
    assert_eq!(report.stats.passed, 3);

    let mut dirs = dirs.lock().unwrap().clone();
    dirs.sort();
    dirs.dedup();
    assert_eq!(dirs.len(), 3, "each repeat got a disjoint output path");
    for path in dirs.iter() {
        assert!(path.exists());
    }
}

#[test]
fn max_failures_cancels_and_exits_nonzero() {
    let mut registry = TestFileRegistry::new();
    registry.register_file("tests/failing.rs", |b: &mut SuiteBuilder| {
        for i in 0..4 {
            b.spec(&format!("broken {i}"), |_args: ArgMap, _info: Arc<TestInfo>| async {
                Err(UserError::fail("nope"))
            });
        }
    });
    let mut config = single_project_config(Project::new("default"));
    config.workers = 1;
    config.max_failures = 1;

    let (report, _lines) = run(&config, &registry);
    assert_eq!(report.stats.cancel_reason, Some(CancelReason::TestFailure));
    assert_eq!(report.stats.exit_code(), 1);
    assert!(report.stats.failure_count() >= 1);
}

#[test]
fn global_deadline_emits_on_timeout_instead_of_on_end() {
    let mut registry = TestFileRegistry::new();
    registry.register_file("tests/hang.rs", |b: &mut SuiteBuilder| {
        b.spec("never finishes", |_args: ArgMap, _info: Arc<TestInfo>| async {
            tokio::time::sleep(std::time::Duration::from_secs(600)).await;
            Ok(())
        });
    });
    let mut project = Project::new("default");
    // No per-test deadline: only the global one can end this run.
    project.timeout = std::time::Duration::ZERO;
    let mut config = single_project_config(project);
    config.global_timeout = std::time::Duration::from_millis(300);

    let (report, lines) = run(&config, &registry);

    assert_eq!(report.stats.cancel_reason, Some(CancelReason::GlobalTimeout));
    assert_eq!(report.stats.exit_code(), 1);
    assert!(
        lines.iter().any(|l| l == "timeout"),
        "on_timeout was emitted: {lines:?}"
    );
    assert!(
        !lines.iter().any(|l| l.starts_with("end ")),
        "on_end is replaced by on_timeout: {lines:?}"
    );
}

#[test]
fn reporter_sees_ordered_begin_end_pairs_per_test() {
    let mut registry = TestFileRegistry::new();
    registry.register_file("tests/a.rs", |b: &mut SuiteBuilder| {
        for i in 0..3 {
            b.spec(&format!("a{i}"), |_args: ArgMap, _info: Arc<TestInfo>| async { Ok(()) });
        }
    });
    registry.register_file("tests/b.rs", |b: &mut SuiteBuilder| {
        for i in 0..3 {
            b.spec(&format!("b{i}"), |_args: ArgMap, _info: Arc<TestInfo>| async { Ok(()) });
        }
    });
    let config = single_project_config(Project::new("default"));

    let (report, lines) = run(&config, &registry);
    assert_eq!(report.stats.passed, 6);

    assert!(lines.first().unwrap().starts_with("begin"));
    assert!(lines.last().unwrap().starts_with("end"));
    // Within the stream, each test's begin strictly precedes its end.
    for line in &lines {
        if let Some(title) = line.strip_prefix("> ") {
            let begin = lines.iter().position(|l| l == &format!("> {title}"));
            let end = lines.iter().position(|l| l.starts_with(&format!("< {title} ")));
            assert!(begin.unwrap() < end.unwrap(), "begin precedes end for {title}");
        }
    }
}
