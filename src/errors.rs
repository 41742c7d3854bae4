// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the toreador runner.

use crate::model::SourceLocation;
use camino::Utf8PathBuf;
use std::{error, fmt, io};

/// An error that occurs while parsing a [`ShardSpec`](crate::shard::ShardSpec)
/// from its `M/N` command-line form.
#[derive(Clone, Debug)]
pub struct ShardSpecParseError {
    message: String,
}

impl ShardSpecParseError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ShardSpecParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "shard must be in the format \"M/N\": {}", self.message)
    }
}

impl error::Error for ShardSpecParseError {}

/// A single `only` marker found while planning with `forbid_only` set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OnlyMarker {
    /// The full, space-joined title of the marked suite or spec.
    pub title: String,
    /// Where the marker was declared.
    pub location: SourceLocation,
}

impl fmt::Display for OnlyMarker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.title, self.location)
    }
}

/// An error produced while planning a run.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PlanError {
    /// `forbid_only` was set and at least one `only` marker was present.
    ///
    /// This is the distinguished fail-fast outcome: no worker is spawned and
    /// the run exits with code 1.
    #[error("`only` markers are forbidden, but {} found", .markers.len())]
    OnlyMarkersForbidden {
        /// Every offending marker, in declaration order.
        markers: Vec<OnlyMarker>,
    },

    /// A registered test file failed its describe pass.
    #[error("failed to load test file `{file}`")]
    FileLoad {
        /// The file that failed to load.
        file: Utf8PathBuf,
        /// The underlying load error.
        #[source]
        error: FileLoadError,
    },

    /// A match, ignore or grep pattern failed to compile.
    #[error("invalid pattern `{pattern}`")]
    BadPattern {
        /// The offending pattern source.
        pattern: String,
        /// The regex compilation error.
        #[source]
        error: Box<regex::Error>,
    },

    /// A project referenced an environment that was never registered.
    #[error("project `{project}` uses unknown environment `{environment}`")]
    UnknownEnvironment {
        /// The project with the dangling reference.
        project: String,
        /// The missing environment name.
        environment: String,
    },
}

/// An error that occurs while executing a file's describe pass.
#[derive(Debug, thiserror::Error)]
pub enum FileLoadError {
    /// The file was not registered.
    #[error("file is not registered")]
    NotRegistered,

    /// The describe function panicked.
    #[error("describe pass panicked: {message}")]
    DescribePanic {
        /// The panic payload, rendered as a string.
        message: String,
    },
}

/// An error that occurs on the parent-child IPC channel.
///
/// Protocol errors are fatal: an unparseable frame terminates the worker.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// An I/O error on the underlying channel.
    #[error("I/O error on IPC channel")]
    Io(#[from] io::Error),

    /// A frame did not contain valid JSON for the expected message type.
    #[error("malformed IPC frame")]
    Malformed(#[from] serde_json::Error),
}

/// An error that occurs while spawning a worker process.
#[derive(Debug, thiserror::Error)]
pub enum WorkerSpawnError {
    /// The child process could not be spawned.
    #[error("failed to spawn worker process `{program}`")]
    Spawn {
        /// The program that failed to spawn.
        program: String,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The child process was spawned without the expected stdio pipes.
    #[error("worker process is missing a stdio pipe")]
    MissingStdio,

    /// The current executable could not be determined for self-spawning.
    #[error("unable to determine current executable")]
    CurrentExe(#[source] io::Error),
}

/// An error that occurs while building a [`Runner`](crate::runner::Runner).
#[derive(Debug, thiserror::Error)]
pub enum RunnerBuildError {
    /// The tokio runtime could not be created.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] io::Error),

    /// A signal handler could not be installed.
    #[error("error setting up signal handler")]
    SignalHandlerSetup(#[from] SignalHandlerSetupError),

    /// The worker launcher could not be constructed.
    #[error("error setting up worker launcher")]
    WorkerLauncher(#[from] WorkerSpawnError),
}

/// An error that occurs while setting up a signal handler.
#[derive(Debug, thiserror::Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] pub(crate) io::Error);

/// A fatal error inside the worker runtime.
///
/// User errors never surface here; they are serialized into test results.
/// This covers protocol violations and broken channels only.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The IPC channel failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A message arrived out of order (e.g. `run` before `init`).
    #[error("unexpected message before init: {kind}")]
    NotInitialized {
        /// The kind of message that arrived early.
        kind: &'static str,
    },

    /// The parent referenced a project absent from the loader snapshot.
    #[error("unknown project `{project}` in run message")]
    UnknownProject {
        /// The missing project name.
        project: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_parse_error_display() {
        let err = ShardSpecParseError::new("expected input '2' to be in the format M/N");
        assert_eq!(
            err.to_string(),
            "shard must be in the format \"M/N\": expected input '2' to be in the format M/N"
        );
    }
}
