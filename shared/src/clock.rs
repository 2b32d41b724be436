//! Application-level millisecond clock with wraparound
//!
//! Each side advances its own clock by the wall time elapsed between ticks.
//! The counter never leaves `[0, modulus)`: once it reaches the modulus it is
//! pulled back by subtracting it. Timestamps captured before such a wrap
//! must go through [`VirtualClock::rebase`] before being compared with
//! post-wrap readings.

use crate::HIGHEST_TIMESTAMP;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct VirtualClock {
    now: i64,
    modulus: i64,
    /// Amount removed by the most recent `advance`
    last_wrap: i64,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::with_modulus(HIGHEST_TIMESTAMP)
    }

    /// Creates a clock that wraps at `modulus` (clamped to at least 1).
    pub fn with_modulus(modulus: i64) -> Self {
        Self {
            now: 0,
            modulus: modulus.max(1),
            last_wrap: 0,
        }
    }

    pub fn now(&self) -> i64 {
        self.now
    }

    /// Advances by a wall-clock delta. Returns true if the counter wrapped.
    pub fn advance(&mut self, delta: Duration) -> bool {
        let millis = i64::try_from(delta.as_millis()).unwrap_or(i64::MAX);
        self.advance_millis(millis)
    }

    /// Advances by `delta` milliseconds. Returns true if the counter wrapped.
    ///
    /// Negative deltas are ignored; the clock only moves forward.
    pub fn advance_millis(&mut self, delta: i64) -> bool {
        let total = self.now.saturating_add(delta.max(0));
        let wraps = total / self.modulus;

        self.last_wrap = wraps * self.modulus;
        self.now = total - self.last_wrap;

        wraps > 0
    }

    /// Moves a timestamp taken before the last `advance` into the current epoch.
    ///
    /// Identity when that advance did not wrap.
    pub fn rebase(&self, timestamp: i64) -> i64 {
        timestamp - self.last_wrap
    }

    /// Overwrites the current value, e.g. with the server time from a heartbeat.
    pub fn set(&mut self, millis: i64) {
        self.now = millis.rem_euclid(self.modulus);
        self.last_wrap = 0;
    }

    /// Elapsed virtual time since `timestamp`.
    pub fn elapsed_since(&self, timestamp: i64) -> i64 {
        self.now - timestamp
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}
