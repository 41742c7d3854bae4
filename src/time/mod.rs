// Copyright (c) The toreador Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Clock support for the runner.

mod stopwatch;

pub(crate) use stopwatch::{stopwatch, StopwatchSnapshot, StopwatchStart};

use std::time::Duration;

/// A duration far enough in the future to stand in for "no deadline".
pub(crate) const fn far_future_duration() -> Duration {
    // Roughly 30 years from now. Tokio's `Instant` cannot represent
    // arbitrarily distant deadlines on every platform.
    Duration::from_secs(86400 * 365 * 30)
}
