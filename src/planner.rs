// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The work planner.
//!
//! Turns registered test files plus the resolved configuration into the flat
//! ordered list of schedulable [`Test`]s, and partitions that list into
//! worker-affinity buckets. The planner is pure: it owns no workers and its
//! only side effect is the fail-fast `forbid_only` outcome.

use crate::{
    config::{Project, RunConfig},
    errors::{OnlyMarker, PlanError},
    model::{expected_status, Annotation, ArgMap, Suite, SuiteChild, Test, TestId},
    registry::TestFileRegistry,
};
use camino::Utf8PathBuf;
use regex::Regex;
use std::{collections::HashMap, sync::Arc};
use xxhash_rust::xxh64::xxh64;

/// The key a bucket is grouped under. Tests sharing a key are compatible
/// with the same worker-scoped environment state.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct BucketKey {
    /// The owning project's name.
    pub project: String,
    /// The test file.
    pub file: Utf8PathBuf,
    /// The repeat index.
    pub repeat_index: u32,
    /// The hash of the worker variation.
    pub variation_hash: u64,
}

/// The unit of work handed to a worker: a contiguous run of tests sharing a
/// [`BucketKey`].
#[derive(Clone, Debug)]
pub struct Bucket {
    /// The grouping key.
    pub key: BucketKey,
    /// The worker variation shared by the bucket.
    pub variation: ArgMap,
    /// The canonical string form of the variation.
    pub variation_string: String,
    /// The bucket's tests, in source order.
    pub tests: Vec<Arc<Test>>,
}

/// The planner's output: the sharded, ordered workload.
#[derive(Clone, Debug)]
pub struct TestPlan {
    /// Every scheduled test, in dispatch order.
    pub tests: Vec<Arc<Test>>,
    /// The tests partitioned into worker-affinity buckets, in order of each
    /// bucket's first test.
    pub buckets: Vec<Bucket>,
}

impl TestPlan {
    /// The number of scheduled tests, including statically skipped ones.
    pub fn test_count(&self) -> usize {
        self.tests.len()
    }
}

/// Plans a run. See module docs.
#[derive(Debug)]
pub struct Planner<'a> {
    config: &'a RunConfig,
    registry: &'a TestFileRegistry,
}

struct CompiledProjectFilters {
    test_match: Vec<Regex>,
    test_ignore: Vec<Regex>,
}

/// One spec observed during the file walk, with inherited state resolved.
struct CollectedSpec {
    ordinal: usize,
    titles: Vec<String>,
    annotations: Vec<Annotation>,
    location: crate::model::SourceLocation,
    timeout: Option<std::time::Duration>,
    included: bool,
}

impl<'a> Planner<'a> {
    /// Creates a planner over the given configuration and registry.
    pub fn new(config: &'a RunConfig, registry: &'a TestFileRegistry) -> Self {
        Self { config, registry }
    }

    /// Produces the ordered, bucketed workload.
    pub fn plan(&self) -> Result<TestPlan, PlanError> {
        let grep = compile_patterns(&self.config.grep)?;
        let mut tests: Vec<Arc<Test>> = Vec::new();
        let mut only_markers: Vec<OnlyMarker> = Vec::new();

        for project in &self.config.projects {
            for environment in &project.use_environments {
                if self.registry.environment(environment).is_none() {
                    return Err(PlanError::UnknownEnvironment {
                        project: project.name.clone(),
                        environment: environment.clone(),
                    });
                }
            }

            let filters = CompiledProjectFilters {
                test_match: compile_patterns(&project.test_match)?,
                test_ignore: compile_patterns(&project.test_ignore)?,
            };

            for file in self.registry.files() {
                if !file_matches(project, &filters, &file.path) {
                    continue;
                }
                let file_suite = self.registry.load(&file.path).map_err(|error| {
                    PlanError::FileLoad {
                        file: file.path.clone(),
                        error,
                    }
                })?;

                if self.config.forbid_only {
                    collect_only_markers(&file_suite.suite, &mut Vec::new(), &mut only_markers);
                }

                let mut specs = Vec::new();
                let mut ordinal = 0;
                collect_specs(
                    &file_suite.suite,
                    &mut Vec::new(),
                    &mut Vec::new(),
                    true,
                    &mut ordinal,
                    &mut specs,
                );

                for variation in project.variations() {
                    let variation_string = canonical_variation_string(&variation);
                    for repeat_index in 0..project.repeat_each.max(1) {
                        for spec in &specs {
                            if !spec.included {
                                continue;
                            }
                            let full_title = spec.titles.join(" ");
                            if !grep.is_empty() && !grep.iter().any(|re| re.is_match(&full_title)) {
                                continue;
                            }
                            tests.push(Arc::new(Test {
                                id: TestId::compute(
                                    &file.path,
                                    spec.ordinal,
                                    &variation_string,
                                    repeat_index,
                                ),
                                project: project.name.clone(),
                                file: file.path.clone(),
                                ordinal: spec.ordinal,
                                titles: spec.titles.clone(),
                                location: spec.location.clone(),
                                annotations: spec.annotations.clone(),
                                expected_status: expected_status(&spec.annotations),
                                timeout: spec.timeout.unwrap_or(project.timeout),
                                retries: project.retries,
                                repeat_index,
                                variation: variation.clone(),
                                variation_string: variation_string.clone(),
                            }));
                        }
                    }
                }
            }
        }

        if self.config.forbid_only && !only_markers.is_empty() {
            return Err(PlanError::OnlyMarkersForbidden {
                markers: only_markers,
            });
        }

        if let Some(shard) = &self.config.shard {
            let (start, end) = shard.window(tests.len());
            tests = tests[start..end].to_vec();
        }

        let buckets = partition(&tests);
        Ok(TestPlan { tests, buckets })
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, PlanError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|error| PlanError::BadPattern {
                pattern: pattern.clone(),
                error: Box::new(error),
            })
        })
        .collect()
}

fn file_matches(project: &Project, filters: &CompiledProjectFilters, path: &Utf8PathBuf) -> bool {
    if !path.starts_with(&project.test_dir) {
        return false;
    }
    let as_str = path.as_str();
    if !filters.test_match.is_empty() && !filters.test_match.iter().any(|re| re.is_match(as_str)) {
        return false;
    }
    !filters.test_ignore.iter().any(|re| re.is_match(as_str))
}

fn child_is_only_path(child: &SuiteChild) -> bool {
    match child {
        SuiteChild::Suite(suite) => suite.only || suite.contains_only(),
        SuiteChild::Spec(spec) => spec.only,
    }
}

/// Walks a suite, assigning ordinals in declaration order and resolving
/// only-filtering: where a level has `only`-marked entries, siblings without
/// the marker are excluded.
fn collect_specs(
    suite: &Suite,
    titles: &mut Vec<String>,
    annotations: &mut Vec<Annotation>,
    included: bool,
    ordinal: &mut usize,
    out: &mut Vec<CollectedSpec>,
) {
    let level_has_only = suite.children.iter().any(child_is_only_path);
    let annotations_base = annotations.len();
    annotations.extend(suite.annotations.iter().cloned());

    for child in &suite.children {
        let child_included = included && (!level_has_only || child_is_only_path(child));
        match child {
            SuiteChild::Suite(child_suite) => {
                let pushed_title = !child_suite.title.is_empty();
                if pushed_title {
                    titles.push(child_suite.title.clone());
                }
                collect_specs(child_suite, titles, annotations, child_included, ordinal, out);
                if pushed_title {
                    titles.pop();
                }
            }
            SuiteChild::Spec(spec) => {
                let mut spec_titles = titles.clone();
                spec_titles.push(spec.title.clone());
                let mut spec_annotations = annotations.clone();
                spec_annotations.extend(spec.annotations.iter().cloned());
                out.push(CollectedSpec {
                    ordinal: *ordinal,
                    titles: spec_titles,
                    annotations: spec_annotations,
                    location: spec.location.clone(),
                    timeout: spec.timeout,
                    included: child_included,
                });
                *ordinal += 1;
            }
        }
    }

    annotations.truncate(annotations_base);
}

fn collect_only_markers(suite: &Suite, titles: &mut Vec<String>, out: &mut Vec<OnlyMarker>) {
    for child in &suite.children {
        match child {
            SuiteChild::Suite(child_suite) => {
                if !child_suite.title.is_empty() {
                    titles.push(child_suite.title.clone());
                }
                if child_suite.only {
                    out.push(OnlyMarker {
                        title: titles.join(" "),
                        location: child_suite.location.clone(),
                    });
                }
                collect_only_markers(child_suite, titles, out);
                if !child_suite.title.is_empty() {
                    titles.pop();
                }
            }
            SuiteChild::Spec(spec) => {
                if spec.only {
                    let mut full = titles.clone();
                    full.push(spec.title.clone());
                    out.push(OnlyMarker {
                        title: full.join(" "),
                        location: spec.location.clone(),
                    });
                }
            }
        }
    }
}

/// The canonical string form of a variation: compact JSON with object keys
/// in map order. Test ids and affinity hashes are derived from it.
pub(crate) fn canonical_variation_string(variation: &ArgMap) -> String {
    serde_json::to_string(&serde_json::Value::Object(variation.clone()))
        .expect("variation maps always serialize")
}

/// Partitions tests into buckets by `(project, file, repeat index, variation
/// hash)`, preserving the order of each bucket's first test.
fn partition(tests: &[Arc<Test>]) -> Vec<Bucket> {
    let mut buckets: Vec<Bucket> = Vec::new();
    let mut index: HashMap<BucketKey, usize> = HashMap::new();

    for test in tests {
        let key = BucketKey {
            project: test.project.clone(),
            file: test.file.clone(),
            repeat_index: test.repeat_index,
            variation_hash: xxh64(test.variation_string.as_bytes(), 0),
        };
        match index.get(&key) {
            Some(&i) => buckets[i].tests.push(test.clone()),
            None => {
                index.insert(key.clone(), buckets.len());
                buckets.push(Bucket {
                    key,
                    variation: test.variation.clone(),
                    variation_string: test.variation_string.clone(),
                    tests: vec![test.clone()],
                });
            }
        }
    }

    buckets
}
