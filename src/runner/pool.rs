// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Worker spawning and transport.
//!
//! The dispatcher talks to workers through [`WorkerHandle`]s; how a worker
//! comes to exist is a launcher concern. Production runs re-execute the
//! current binary with the worker marker set ([`WorkerMode::Process`]);
//! tests and single-process embeddings run the worker runtime as an
//! in-process task over duplex pipes ([`WorkerMode::InProcess`]).

use crate::{
    errors::WorkerSpawnError,
    protocol::{self, ParentMessage, WorkerMessage},
    registry::TestFileRegistry,
    runner::internal_events::WorkerEvent,
    worker::{self, output_capture},
};
use std::{path::PathBuf, process::Stdio, sync::Arc};
use tokio::{
    process::Command,
    sync::{
        mpsc::{unbounded_channel, UnboundedSender},
        oneshot,
    },
};
use tracing::debug;

/// How the dispatcher obtains worker processes.
#[derive(Clone, Debug, Default)]
pub enum WorkerMode {
    /// Re-execute the current binary with the worker marker environment
    /// variable set. The embedding binary must route worker invocations to
    /// [`worker::worker_main`](crate::worker::worker_main).
    #[default]
    Process,
    /// Run each worker as a task inside this process, over in-memory pipes.
    /// No isolation, but no spawn cost either; used by tests and by
    /// embeddings that cannot re-execute themselves.
    InProcess,
}

/// A live worker as the dispatcher sees it: a message channel and a kill
/// switch.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    msg_tx: UnboundedSender<ParentMessage>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(
        msg_tx: UnboundedSender<ParentMessage>,
        kill_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            msg_tx,
            kill_tx: Some(kill_tx),
        }
    }

    /// Sends a message; returns false when the worker is gone.
    pub(crate) fn send(&self, message: ParentMessage) -> bool {
        self.msg_tx.send(message).is_ok()
    }

    /// Force-kills the worker. Idempotent.
    pub(crate) fn kill(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }
}

/// Spawns workers on demand.
pub(crate) trait WorkerLauncher: Send + Sync {
    /// Launches a worker for `worker_index`. Events from its channel are
    /// delivered to `events` tagged with the index; the launcher guarantees
    /// a final [`WorkerEvent::Exited`] per launch.
    fn launch(
        &self,
        worker_index: usize,
        events: UnboundedSender<(usize, WorkerEvent)>,
    ) -> Result<WorkerHandle, WorkerSpawnError>;
}

/// Launches workers by re-executing the current binary.
pub(crate) struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub(crate) fn from_current_exe() -> Result<Self, WorkerSpawnError> {
        let program = std::env::current_exe().map_err(WorkerSpawnError::CurrentExe)?;
        Ok(Self { program })
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        worker_index: usize,
        events: UnboundedSender<(usize, WorkerEvent)>,
    ) -> Result<WorkerHandle, WorkerSpawnError> {
        let mut child = Command::new(&self.program)
            .env(worker::WORKER_ENV, worker_index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| WorkerSpawnError::Spawn {
                program: self.program.display().to_string(),
                error,
            })?;

        let stdin = child.stdin.take().ok_or(WorkerSpawnError::MissingStdio)?;
        let stdout = child.stdout.take().ok_or(WorkerSpawnError::MissingStdio)?;

        let (msg_tx, mut msg_rx) = unbounded_channel::<ParentMessage>();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        // Writer: drain outgoing messages into the child's stdin. Closing
        // the channel closes stdin, which a worker treats as a disconnect.
        tokio::spawn(async move {
            let mut framed = protocol::framed_write(stdin);
            while let Some(message) = msg_rx.recv().await {
                if protocol::send(&mut framed, &message).await.is_err() {
                    break;
                }
            }
        });

        // Reader: forward worker messages until EOF or kill, then reap the
        // child and report the exit.
        tokio::spawn(async move {
            let mut framed = protocol::framed_read(stdout);
            loop {
                tokio::select! {
                    message = protocol::recv::<_, WorkerMessage>(&mut framed) => {
                        match message {
                            Ok(Some(message)) => {
                                if events.send((worker_index, WorkerEvent::Message(message))).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(error) => {
                                debug!(worker_index, %error, "unparseable worker frame");
                                break;
                            }
                        }
                    }
                    _ = &mut kill_rx => {
                        let _ = child.start_kill();
                        break;
                    }
                }
            }
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(_) => None,
            };
            let _ = events.send((worker_index, WorkerEvent::Exited { code }));
        });

        Ok(WorkerHandle::new(msg_tx, kill_tx))
    }
}

/// Runs each worker as an in-process task over duplex pipes.
pub(crate) struct LocalLauncher {
    registry: Arc<TestFileRegistry>,
}

impl LocalLauncher {
    pub(crate) fn new(registry: Arc<TestFileRegistry>) -> Self {
        Self { registry }
    }
}

impl WorkerLauncher for LocalLauncher {
    fn launch(
        &self,
        worker_index: usize,
        events: UnboundedSender<(usize, WorkerEvent)>,
    ) -> Result<WorkerHandle, WorkerSpawnError> {
        let (parent_io, worker_io) = tokio::io::duplex(256 * 1024);
        let (parent_read, parent_write) = tokio::io::split(parent_io);
        let (worker_read, worker_write) = tokio::io::split(worker_io);

        let registry = self.registry.clone();
        let worker_task = tokio::spawn(async move {
            let result = worker::run_worker(
                registry,
                worker_read,
                worker_write,
                output_capture::disabled(),
            )
            .await;
            if let Err(error) = result {
                debug!(worker_index, %error, "in-process worker failed");
            }
        });

        let (msg_tx, mut msg_rx) = unbounded_channel::<ParentMessage>();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let mut framed = protocol::framed_write(parent_write);
            while let Some(message) = msg_rx.recv().await {
                if protocol::send(&mut framed, &message).await.is_err() {
                    break;
                }
            }
            // Dropping the writer half closes the worker's read side.
        });

        tokio::spawn(async move {
            let mut framed = protocol::framed_read(parent_read);
            let mut worker_task = worker_task;
            loop {
                tokio::select! {
                    message = protocol::recv::<_, WorkerMessage>(&mut framed) => {
                        match message {
                            Ok(Some(message)) => {
                                if events.send((worker_index, WorkerEvent::Message(message))).is_err() {
                                    break;
                                }
                            }
                            Ok(None) | Err(_) => break,
                        }
                    }
                    _ = &mut kill_rx => {
                        worker_task.abort();
                        break;
                    }
                }
            }
            let _ = (&mut worker_task).await;
            let _ = events.send((worker_index, WorkerEvent::Exited { code: None }));
        });

        Ok(WorkerHandle::new(msg_tx, kill_tx))
    }
}
