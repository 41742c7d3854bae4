// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Scheduling and execution engine for the toreador parallel test runner.
//!
//! This crate contains the core of the runner: the [planner](crate::planner)
//! that turns registered test files into an ordered, bucketed workload, the
//! [dispatcher](crate::runner) that drives that workload across a pool of
//! worker processes, the [worker runtime](crate::worker) that executes tests
//! inside each child process, and the [protocol](crate::protocol) spoken
//! between the two.
//!
//! The command-line front end, configuration file parsing, assertion
//! libraries and individual reporter implementations are external consumers
//! of this crate.

pub mod config;
pub mod environment;
pub mod errors;
pub mod model;
pub mod planner;
pub mod protocol;
pub mod registry;
pub mod reporter;
pub mod runner;
pub mod shard;
pub mod signal;
mod time;
pub mod worker;

pub use config::{Project, RunConfig};
pub use model::{Test, TestId, TestResult, TestStatus};
pub use planner::{Planner, TestPlan};
pub use registry::{SuiteBuilder, TestFileRegistry};
pub use runner::{Runner, RunnerBuilder};
