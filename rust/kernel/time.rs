// SPDX-License-Identifier: GPL-2.0 OR MIT

//! Timekeeping helpers for bounded waits.

use core::time::Duration;
use std::time::Instant;

/// Value used by callers to request an unbounded wait.
pub const MAX_SCHEDULE_TIMEOUT: Option<Duration> = None;

/// Converts a millisecond count to a timeout.
pub fn msecs_to_timeout(ms: u32) -> Option<Duration> {
    Some(Duration::from_millis(ms.into()))
}

/// A point in time after which a bounded wait gives up.
#[derive(Clone, Copy, Debug)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// Creates a deadline `timeout` from now, or one that never expires.
    pub fn new(timeout: Option<Duration>) -> Deadline {
        Deadline(timeout.map(|t| Instant::now() + t))
    }

    /// Returns whether the deadline has passed.
    pub fn expired(&self) -> bool {
        matches!(self.0, Some(t) if Instant::now() >= t)
    }

    /// Returns the time left, clamped to `max`.
    pub fn remaining(&self, max: Duration) -> Duration {
        match self.0 {
            None => max,
            Some(t) => t.saturating_duration_since(Instant::now()).min(max),
        }
    }
}
