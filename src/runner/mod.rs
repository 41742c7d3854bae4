// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The dispatcher: drives the planned workload across a bounded pool of
//! worker processes.
//!
//! For the basic flow of operations, see the crate-level docs.

mod dispatcher;
mod imp;
mod internal_events;
mod pool;

pub use imp::{RunReport, Runner, RunnerBuilder};
pub use pool::WorkerMode;
