// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Internal events used between the runner components.
//!
//! These mirror the wire protocol but are tagged with the worker slot they
//! came from, and add lifecycle events the protocol does not carry (process
//! exit).

use crate::protocol::WorkerMessage;

/// An event observed on one worker slot's channel.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// A protocol message arrived from the worker.
    Message(WorkerMessage),
    /// The worker's channel closed: process exit, crash, or task
    /// completion. `code` is the exit code when one was observable.
    Exited {
        /// The process exit code, if known.
        code: Option<i32>,
    },
}

/// The dispatcher-side state of one worker slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(super) enum SlotState {
    /// No live worker. The slot can spawn.
    Vacant,
    /// `init` sent, waiting for `ready`.
    Initializing,
    /// Live and waiting for a bucket.
    Idle,
    /// Running a bucket.
    Assigned,
}
