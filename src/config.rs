// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resolved run configuration.
//!
//! Configuration *files* are parsed by the front end; this crate receives the
//! fully resolved form. Everything here is immutable for the duration of a
//! run and serializable, because the worker receives a snapshot of it inside
//! the `init` message.

use crate::{model::ArgMap, shard::ShardSpec};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The default per-test deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long workers get to shut down gracefully before being killed.
pub(crate) const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// A named run configuration: where to find tests, how often to run and
/// retry them, and where their output goes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// The project name. Must be unique within a run.
    pub name: String,
    /// The directory test files live under.
    pub test_dir: Utf8PathBuf,
    /// Regex patterns a file path must match to belong to this project.
    /// An empty list matches every file under `test_dir`.
    #[serde(default)]
    pub test_match: Vec<String>,
    /// Regex patterns that exclude files even when matched.
    #[serde(default)]
    pub test_ignore: Vec<String>,
    /// How many retries each test is allowed.
    #[serde(default)]
    pub retries: u32,
    /// How many times each test is repeated. 1 means run once.
    #[serde(default = "default_repeat_each")]
    pub repeat_each: u32,
    /// The per-test deadline. Zero disables the deadline.
    #[serde(with = "duration_millis", default = "default_timeout")]
    pub timeout: Duration,
    /// Where test output directories are created.
    pub output_dir: Utf8PathBuf,
    /// Where snapshot files live.
    pub snapshot_dir: Utf8PathBuf,
    /// Worker variations: each object multiplies every spec into one test
    /// per variation. An empty list behaves as a single empty variation.
    #[serde(default)]
    pub define: Vec<ArgMap>,
    /// Ordered names of the environments composed around each test.
    #[serde(default)]
    pub use_environments: Vec<String>,
}

fn default_repeat_each() -> u32 {
    1
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

impl Project {
    /// Creates a project with defaults rooted at `./tests`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            test_dir: Utf8PathBuf::from("tests"),
            name: name.clone(),
            test_match: Vec::new(),
            test_ignore: Vec::new(),
            retries: 0,
            repeat_each: 1,
            timeout: DEFAULT_TIMEOUT,
            output_dir: Utf8PathBuf::from("target/toreador").join(&name),
            snapshot_dir: Utf8PathBuf::from("tests/__snapshots__"),
            define: Vec::new(),
            use_environments: Vec::new(),
        }
    }

    /// The variations this project schedules, with the implicit empty
    /// variation when `define` is empty.
    pub(crate) fn variations(&self) -> Vec<ArgMap> {
        if self.define.is_empty() {
            vec![ArgMap::new()]
        } else {
            self.define.clone()
        }
    }
}

/// The resolved configuration for one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    /// Projects, in declaration order.
    pub projects: Vec<Project>,
    /// The maximum number of concurrent worker processes.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Patterns a test's full title must match to be scheduled. An empty
    /// list keeps everything.
    #[serde(default)]
    pub grep: Vec<String>,
    /// The shard window this invocation executes, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardSpec>,
    /// Fail fast when any `only` marker is present.
    #[serde(default)]
    pub forbid_only: bool,
    /// Stop the run once this many tests have failed. Zero disables the
    /// limit.
    #[serde(default)]
    pub max_failures: usize,
    /// A deadline for the entire run. Zero disables it.
    #[serde(with = "duration_millis", default)]
    pub global_timeout: Duration,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl RunConfig {
    /// Creates a run configuration over the given projects with defaults.
    pub fn new(projects: Vec<Project>) -> Self {
        Self {
            projects,
            workers: default_workers(),
            grep: Vec::new(),
            shard: None,
            forbid_only: false,
            max_failures: 0,
            global_timeout: Duration::ZERO,
        }
    }

    pub(crate) fn project(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name == name)
    }
}

/// The opaque configuration snapshot carried in the `init` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderSnapshot {
    /// The full resolved configuration.
    pub config: RunConfig,
}

/// Serde support for durations expressed as integer milliseconds, the form
/// they take on the wire.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serializes a duration as integer milliseconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    /// Deserializes a duration from integer milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_roundtrips_through_json() {
        let mut project = Project::new("chromium");
        project.retries = 2;
        project.timeout = Duration::from_millis(1500);
        let json = serde_json::to_string(&project).unwrap();
        let back: Project = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "chromium");
        assert_eq!(back.retries, 2);
        assert_eq!(back.timeout, Duration::from_millis(1500));
        assert_eq!(back.repeat_each, 1);
    }

    #[test]
    fn empty_define_is_one_variation() {
        let project = Project::new("default");
        assert_eq!(project.variations().len(), 1);
        assert!(project.variations()[0].is_empty());
    }
}
