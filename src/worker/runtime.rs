// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker's message loop.
//!
//! A worker receives `init` exactly once, then any number of `run` messages,
//! and finally `stop` or a channel disconnect. Buckets execute one at a
//! time; `stop` received mid-bucket finishes the current test gracefully and
//! reports the unexecuted entries in the bucket's `done`.

use crate::{
    config::{LoaderSnapshot, Project, SHUTDOWN_GRACE_PERIOD},
    environment::EnvironmentStack,
    errors::WorkerError,
    model::{FileSuite, SerializedError, TestId, WorkerInfo},
    protocol::{self, DoneMessage, ParentMessage, RunMessage, StdioChunk, WorkerMessage},
    registry::TestFileRegistry,
    worker::{
        exec::BucketRunner,
        output_capture::{CapturedStream, OutputCaptureHandle},
    },
};
use camino::Utf8PathBuf;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc::{unbounded_channel, UnboundedSender},
};
use tracing::{debug, warn};

/// A worker-scoped environment stack plus the info it was initialized with.
struct WorkerScope {
    env: EnvironmentStack,
    info: Arc<WorkerInfo>,
}

/// Runs the worker runtime over the given channel until `stop` or
/// disconnect. This is the whole life of a worker process, but it is
/// transport-agnostic: in-process workers drive it over duplex pipes.
pub(crate) async fn run_worker<R, W>(
    registry: Arc<TestFileRegistry>,
    reader: R,
    writer: W,
    capture: OutputCaptureHandle,
) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut framed_read = protocol::framed_read(reader);
    let mut framed_write = protocol::framed_write(writer);

    let (msg_tx, mut msg_rx) = unbounded_channel::<WorkerMessage>();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = msg_rx.recv().await {
            if protocol::send(&mut framed_write, &message).await.is_err() {
                debug!("IPC write failed, dropping remaining messages");
                break;
            }
        }
    });

    // Forward captured stdio, attributed to the test running at arrival.
    let current_test: Arc<Mutex<Option<TestId>>> = Arc::new(Mutex::new(None));
    let mut chunks = capture.chunks;
    let pump_task = {
        let msg_tx = msg_tx.clone();
        let current_test = current_test.clone();
        tokio::spawn(async move {
            while let Some(chunk) = chunks.recv().await {
                let test_id = current_test.lock().unwrap().clone();
                let stdio = StdioChunk::from_bytes(test_id, &chunk.bytes);
                let message = match chunk.stream {
                    CapturedStream::Out => WorkerMessage::StdOut(stdio),
                    CapturedStream::Err => WorkerMessage::StdErr(stdio),
                };
                if msg_tx.send(message).is_err() {
                    break;
                }
            }
        })
    };

    let stop = Arc::new(AtomicBool::new(false));
    let mut init: Option<InitState> = None;
    let mut scopes: HashMap<(String, String), WorkerScope> = HashMap::new();
    let mut file_cache: HashMap<Utf8PathBuf, FileSuite> = HashMap::new();

    let loop_result: Result<(), WorkerError> = loop {
        let message = match protocol::recv::<_, ParentMessage>(&mut framed_read).await {
            Ok(message) => message,
            Err(error) => break Err(error.into()),
        };
        match message {
            None => {
                debug!("IPC channel disconnected");
                let _ = msg_tx.send(WorkerMessage::Done(DoneMessage::default()));
                break Ok(());
            }
            Some(ParentMessage::Stop {}) => {
                let _ = msg_tx.send(WorkerMessage::Done(DoneMessage::default()));
                break Ok(());
            }
            Some(ParentMessage::Init(message)) => {
                init = Some(InitState {
                    worker_index: message.worker_index,
                    loader: message.loader,
                });
                let _ = msg_tx.send(WorkerMessage::Ready {});
            }
            Some(ParentMessage::Run(run)) => {
                let Some(init) = init.as_ref() else {
                    break Err(WorkerError::NotInitialized { kind: "run" });
                };
                let done = match prepare_bucket(
                    init,
                    &registry,
                    &mut scopes,
                    &mut file_cache,
                    &run,
                )
                .await
                {
                    Ok(prepared) => {
                        run_bucket_interruptible(
                            prepared,
                            &run,
                            &msg_tx,
                            &current_test,
                            &stop,
                            &mut framed_read,
                        )
                        .await?
                    }
                    Err(fatal_error) => DoneMessage {
                        failed_test_id: None,
                        fatal_error: Some(fatal_error),
                        remaining: run.entries.clone(),
                    },
                };
                let _ = msg_tx.send(WorkerMessage::Done(done));
                if stop.load(Ordering::Acquire) {
                    break Ok(());
                }
            }
        }
    };

    // Tear down worker-scoped environments. The escape timer guarantees the
    // worker exits even if teardown hangs.
    let teardown = async {
        for scope in scopes.values_mut() {
            let WorkerScope { env, info } = scope;
            for error in env.after_all(info).await {
                let _ = msg_tx.send(WorkerMessage::TeardownError { error });
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, teardown)
        .await
        .is_err()
    {
        warn!("environment teardown exceeded the shutdown grace period");
    }

    drop(msg_tx);
    pump_task.abort();
    let _ = writer_task.await;

    loop_result
}

struct InitState {
    worker_index: usize,
    loader: LoaderSnapshot,
}

/// The borrowed pieces a bucket run needs.
struct PreparedBucket<'a> {
    project: Project,
    worker_scope: &'a WorkerScope,
    file_suite: &'a FileSuite,
}

/// Resolves the project, worker-scoped environment stack and file suite for
/// a bucket. Any failure here is a bucket-fatal error: the dispatcher marks
/// the whole bucket failed and does not retry.
async fn prepare_bucket<'a>(
    init: &InitState,
    registry: &TestFileRegistry,
    scopes: &'a mut HashMap<(String, String), WorkerScope>,
    file_cache: &'a mut HashMap<Utf8PathBuf, FileSuite>,
    run: &RunMessage,
) -> Result<PreparedBucket<'a>, SerializedError> {
    let project = init
        .loader
        .config
        .project(&run.project)
        .cloned()
        .ok_or_else(|| {
            SerializedError::from_message(format!("unknown project `{}`", run.project))
        })?;

    let scope_key = (run.project.clone(), run.variation_string.clone());
    if !scopes.contains_key(&scope_key) {
        let mut environments = Vec::with_capacity(project.use_environments.len());
        for name in &project.use_environments {
            let environment = registry.environment(name).ok_or_else(|| {
                SerializedError::from_message(format!("unknown environment `{name}`"))
            })?;
            environments.push((name.clone(), environment));
        }
        let info = Arc::new(WorkerInfo {
            worker_index: init.worker_index,
            project: project.clone(),
            variation: run.variation.clone(),
        });
        let mut env = EnvironmentStack::new(environments);
        env.before_all(&info).await?;
        scopes.insert(scope_key.clone(), WorkerScope { env, info });
    }

    if !file_cache.contains_key(&run.file) {
        let file_suite = registry
            .load(&run.file)
            .map_err(|error| SerializedError::from_message(error.to_string()))?;
        file_cache.insert(run.file.clone(), file_suite);
    }

    Ok(PreparedBucket {
        project,
        worker_scope: &scopes[&scope_key],
        file_suite: &file_cache[&run.file],
    })
}

/// Runs one bucket while still listening for `stop` on the channel. A stop
/// raises the flag; the runner finishes the current test, reports the rest
/// as remaining, and the outer loop shuts down.
async fn run_bucket_interruptible<R>(
    prepared: PreparedBucket<'_>,
    run: &RunMessage,
    msg_tx: &UnboundedSender<WorkerMessage>,
    current_test: &Arc<Mutex<Option<TestId>>>,
    stop: &Arc<AtomicBool>,
    framed_read: &mut tokio_util::codec::FramedRead<R, tokio_util::codec::LengthDelimitedCodec>,
) -> Result<DoneMessage, WorkerError>
where
    R: AsyncRead + Unpin,
{
    let runner = BucketRunner {
        project: &prepared.project,
        run,
        env: &prepared.worker_scope.env,
        worker_info: &prepared.worker_scope.info,
        emitter: msg_tx,
        current_test: current_test.as_ref(),
        stop: stop.as_ref(),
    };
    let bucket_fut = runner.execute(prepared.file_suite);
    tokio::pin!(bucket_fut);

    loop {
        tokio::select! {
            done = &mut bucket_fut => break Ok(done),
            message = protocol::recv::<_, ParentMessage>(framed_read) => {
                match message? {
                    Some(ParentMessage::Stop {}) | None => {
                        stop.store(true, Ordering::Release);
                    }
                    Some(other) => {
                        warn!(?other, "unexpected message during a run, ignoring");
                    }
                }
            }
        }
    }
}
