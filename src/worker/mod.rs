// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker runtime: everything that runs inside a child process.
//!
//! The dispatcher spawns workers by re-executing the current binary with
//! [`WORKER_ENV`] set. An embedding binary checks for worker mode first
//! thing in `main`:
//!
//! ```ignore
//! fn main() {
//!     let registry = build_registry();
//!     if toreador_runner::worker::worker_index_from_env().is_some() {
//!         toreador_runner::worker::worker_main(registry);
//!     }
//!     // ... normal front-end flow ...
//! }
//! ```

pub(crate) mod exec;
pub(crate) mod output_capture;
pub(crate) mod paths;
mod runtime;

pub(crate) use output_capture::OutputCaptureHandle;
pub(crate) use runtime::run_worker;

use crate::registry::TestFileRegistry;
use std::sync::Arc;
use tracing::warn;

/// The environment variable that marks a process as a worker. Its value is
/// the worker slot index.
pub const WORKER_ENV: &str = "TOREADOR_WORKER";

/// Returns the worker slot index when the current process was spawned as a
/// worker.
pub fn worker_index_from_env() -> Option<usize> {
    std::env::var(WORKER_ENV).ok()?.parse().ok()
}

/// The worker process entry point: installs stdio capture, runs the worker
/// runtime over stdin/stdout, and exits.
///
/// Never returns. Call it from `main` before any other output is produced;
/// stdout belongs to the IPC channel.
pub fn worker_main(registry: TestFileRegistry) -> ! {
    let capture = match output_capture::install() {
        Ok(capture) => capture,
        Err(error) => {
            warn!(%error, "stdio capture unavailable, user output will be interleaved");
            output_capture::disabled()
        }
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("worker runtime creation failed");

    let registry = Arc::new(registry);
    let code = runtime.block_on(async move {
        let stdin = tokio::io::stdin();
        let result = match capture {
            OutputCaptureHandle {
                chunks,
                ipc_stdout: Some(ipc_stdout),
            } => {
                let writer = tokio::fs::File::from_std(ipc_stdout);
                run_worker(
                    registry,
                    stdin,
                    writer,
                    OutputCaptureHandle {
                        chunks,
                        ipc_stdout: None,
                    },
                )
                .await
            }
            capture => run_worker(registry, stdin, tokio::io::stdout(), capture).await,
        };
        match result {
            Ok(()) => 0,
            Err(error) => {
                warn!(%error, "worker terminated with a protocol error");
                1
            }
        }
    });

    std::process::exit(code)
}
