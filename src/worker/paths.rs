// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Output and snapshot path computation.
//!
//! Every attempt gets a directory disjoint from every other concurrently
//! running attempt: the retry and repeat suffixes keep attempts of the same
//! test apart, and the title/file components keep tests apart. Snapshot
//! paths deliberately omit the suffixes -- snapshots are shared across
//! attempts.

use crate::config::Project;
use camino::{Utf8Path, Utf8PathBuf};

const MAX_COMPONENT_LEN: usize = 100;

/// Flattens a title chain into a single filesystem-safe component.
pub(crate) fn sanitize_title(titles: &[String]) -> String {
    let joined = titles.join("-");
    let mut out = String::with_capacity(joined.len());
    let mut last_dash = true;
    for ch in joined.chars() {
        let keep = ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.');
        if keep {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out.truncate(MAX_COMPONENT_LEN);
    if out.is_empty() {
        out.push_str("test");
    }
    out
}

/// The test file's path relative to the project's test directory, extension
/// stripped.
fn file_component(project: &Project, file: &Utf8Path) -> Utf8PathBuf {
    let relative = file.strip_prefix(&project.test_dir).unwrap_or(file);
    relative.with_extension("")
}

/// The output directory for one attempt:
/// `<output_dir>/<file>/<title>[-retryN][-repeatN]/`.
pub(crate) fn output_dir(
    project: &Project,
    file: &Utf8Path,
    titles: &[String],
    retry: u32,
    repeat_index: u32,
) -> Utf8PathBuf {
    let mut leaf = sanitize_title(titles);
    if retry > 0 {
        leaf.push_str(&format!("-retry{retry}"));
    }
    if repeat_index > 0 {
        leaf.push_str(&format!("-repeat{repeat_index}"));
    }
    project
        .output_dir
        .join(file_component(project, file))
        .join(leaf)
}

/// The snapshot directory for a test:
/// `<snapshot_dir>/<file>/<title>/`, shared across attempts and repeats.
pub(crate) fn snapshot_dir(project: &Project, file: &Utf8Path, titles: &[String]) -> Utf8PathBuf {
    project
        .snapshot_dir
        .join(file_component(project, file))
        .join(sanitize_title(titles))
}
