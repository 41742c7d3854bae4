// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::RunConfig,
    errors::RunnerBuildError,
    model::{TestId, TestResult},
    planner::TestPlan,
    registry::TestFileRegistry,
    reporter::{events::RunStats, Reporter, ReporterMux},
    runner::{
        dispatcher::DispatcherContext,
        pool::{LocalLauncher, ProcessLauncher, WorkerLauncher, WorkerMode},
    },
    signal::{SignalHandler, SignalHandlerKind},
};
use chrono::{DateTime, Local};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{runtime::Runtime, sync::mpsc::unbounded_channel};
use tracing::debug;

/// Runner options.
#[derive(Debug, Default)]
pub struct RunnerBuilder {
    signal_handler_kind: Option<SignalHandlerKind>,
    worker_mode: WorkerMode,
}

impl RunnerBuilder {
    /// Sets the kind of signal handling for the run. Defaults to
    /// [`SignalHandlerKind::Standard`].
    pub fn set_signal_handler_kind(&mut self, kind: SignalHandlerKind) -> &mut Self {
        self.signal_handler_kind = Some(kind);
        self
    }

    /// Sets how workers are obtained. Defaults to [`WorkerMode::Process`].
    pub fn set_worker_mode(&mut self, mode: WorkerMode) -> &mut Self {
        self.worker_mode = mode;
        self
    }

    /// Creates a new runner over an already-computed plan.
    pub fn build<'a>(
        self,
        config: &'a RunConfig,
        registry: &'a TestFileRegistry,
        plan: &'a TestPlan,
    ) -> Result<Runner<'a>, RunnerBuildError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("toreador-runner-worker")
            .build()
            .map_err(RunnerBuildError::TokioRuntimeCreate)?;
        let _guard = runtime.enter();

        // signal_handler.build() must be called from within the guard.
        let signal_handler = self
            .signal_handler_kind
            .unwrap_or(SignalHandlerKind::Standard)
            .build()?;

        let launcher: Box<dyn WorkerLauncher> = match self.worker_mode {
            WorkerMode::Process => Box::new(ProcessLauncher::from_current_exe()?),
            WorkerMode::InProcess => Box::new(LocalLauncher::new(Arc::new(registry.clone()))),
        };

        Ok(Runner {
            config,
            plan,
            runtime,
            signal_handler,
            launcher,
        })
    }
}

/// The final report of a run.
#[derive(Clone, Debug)]
pub struct RunReport {
    /// Aggregate statistics, including the exit-code mapping.
    pub stats: RunStats,
    /// Every attempt of every test that produced one, keyed by test id.
    pub results: BTreeMap<TestId, Vec<TestResult>>,
    /// When the run started (realtime clock).
    pub started_at: DateTime<Local>,
    /// How long the run took (monotonic clock).
    pub elapsed: Duration,
}

/// Context for running tests. Created with [`RunnerBuilder::build`].
pub struct Runner<'a> {
    config: &'a RunConfig,
    plan: &'a TestPlan,
    runtime: Runtime,
    signal_handler: SignalHandler,
    launcher: Box<dyn WorkerLauncher>,
}

impl Runner<'_> {
    /// Executes the planned workload across the worker pool, streaming
    /// events to the given reporters, and returns the final report.
    pub fn execute(self, reporters: Vec<Box<dyn Reporter>>) -> RunReport {
        let Runner {
            config,
            plan,
            runtime,
            mut signal_handler,
            launcher,
        } = self;

        // Project output directories are deleted once, before any worker
        // can write into them.
        for project in &config.projects {
            match std::fs::remove_dir_all(&project.output_dir) {
                Ok(()) => debug!(dir = %project.output_dir, "cleared output directory"),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    debug!(dir = %project.output_dir, %error, "could not clear output directory");
                }
            }
        }

        let stopwatch = crate::time::stopwatch();
        let mut mux = ReporterMux::new(reporters);
        let (events_tx, mut events_rx) = unbounded_channel();
        let mut cx = DispatcherContext::new(config, plan, launcher.as_ref(), &mut mux, events_tx);

        runtime.block_on(cx.run(&mut events_rx, &mut signal_handler));

        let stats = cx.run_stats();
        let results = cx.into_results();
        drop(mux);

        // Reader/writer tasks spawned for workers may still be draining;
        // shut the runtime down without waiting on them.
        runtime.shutdown_background();

        let snapshot = stopwatch.snapshot();
        RunReport {
            stats,
            results,
            started_at: snapshot.start_time,
            elapsed: snapshot.duration,
        }
    }
}
