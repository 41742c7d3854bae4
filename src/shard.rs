// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support for sharding a run across several machines.
//!
//! A shard is a contiguous slice of the scheduled test list. Shards are
//! one-based externally (`--shard 2/3`) and zero-based internally.

use crate::errors::ShardSpecParseError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// A shard window: which contiguous slice of the scheduled test list this
/// invocation executes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardSpec {
    /// The shard this invocation executes, zero-based.
    pub current: u64,
    /// The total number of shards.
    pub total: u64,
}

impl ShardSpec {
    /// Creates a shard spec from the external one-based form.
    pub fn new(one_based_current: u64, total: u64) -> Result<Self, ShardSpecParseError> {
        if !(1..=total).contains(&one_based_current) {
            return Err(ShardSpecParseError::new(format!(
                "shard {one_based_current} must be a number between 1 and total shards {total}, inclusive"
            )));
        }
        Ok(Self {
            current: one_based_current - 1,
            total,
        })
    }

    /// Returns the `[start, end)` window of this shard over a list of `len`
    /// items, slicing into `total` contiguous chunks of as-equal-as-possible
    /// size. Earlier shards absorb the remainder.
    pub fn window(&self, len: usize) -> (usize, usize) {
        let total = self.total as usize;
        let current = self.current as usize;
        let base = len / total;
        let remainder = len % total;
        let start = current * base + current.min(remainder);
        let size = base + usize::from(current < remainder);
        (start, start + size)
    }
}

impl fmt::Display for ShardSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.current + 1, self.total)
    }
}

impl FromStr for ShardSpec {
    type Err = ShardSpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut split = s.splitn(2, '/');
        // First "next" always returns a value.
        let current_str = split.next().expect("split should have at least 1 element");
        // Second "next" may or may not return a value.
        let total_str = split.next().ok_or_else(|| {
            ShardSpecParseError::new(format!("expected input '{s}' to be in the format M/N"))
        })?;

        let current: u64 = current_str.parse().map_err(|err| {
            ShardSpecParseError::new(format!("failed to parse shard '{current_str}' as u64: {err}"))
        })?;
        let total: u64 = total_str.parse().map_err(|err| {
            ShardSpecParseError::new(format!(
                "failed to parse total shards '{total_str}' as u64: {err}"
            ))
        })?;

        Self::new(current, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_spec_from_str() {
        let successes = vec![
            ("1/1", ShardSpec { current: 0, total: 1 }),
            ("1/2", ShardSpec { current: 0, total: 2 }),
            ("2/3", ShardSpec { current: 1, total: 3 }),
            ("99/200", ShardSpec { current: 98, total: 200 }),
        ];
        let failures = vec!["", "2", "2/", "/3", "0/2", "3/2", "m/2", "1/n"];

        for (input, output) in successes {
            assert_eq!(
                ShardSpec::from_str(input).unwrap_or_else(|err| panic!(
                    "expected input '{input}' to succeed, failed with: {err}"
                )),
                output,
                "success case '{input}' matches",
            );
        }
        for input in failures {
            ShardSpec::from_str(input).expect_err(&format!("expected input '{input}' to fail"));
        }
    }

    #[test]
    fn window_covers_list_exactly() {
        // 12 tests over 3 shards: shard 2/3 takes zero-based indices 4..8.
        let spec = ShardSpec::from_str("2/3").unwrap();
        assert_eq!(spec.window(12), (4, 8));

        // Uneven split: earlier shards absorb the remainder.
        let total = 4;
        for len in [0usize, 1, 3, 7, 10, 11] {
            let mut covered = Vec::new();
            for current in 1..=total {
                let spec = ShardSpec::new(current, total as u64).unwrap();
                let (start, end) = spec.window(len);
                assert!(end <= len);
                covered.extend(start..end);
            }
            assert_eq!(covered, (0..len).collect::<Vec<_>>(), "len {len}");
        }
    }
}
