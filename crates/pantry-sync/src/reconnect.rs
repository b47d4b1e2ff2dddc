//! # Reconnect Policy
//!
//! Linear backoff with a ceiling on consecutive failures.
//!
//! ```text
//!  failure #   delay (unit 2s, cap 10s, ceiling 5)
//!  ─────────   ──────────────────────────────────
//!      1        2s
//!      2        4s
//!      3        6s
//!      4        8s
//!      5        stop: terminal error, only an explicit connect() retries
//! ```
//!
//! Implements [`backoff::backoff::Backoff`] so it plugs into the same
//! machinery as the exponential policy used elsewhere.

use std::time::Duration;

use backoff::backoff::Backoff;

/// Reconnect policy: `min(attempts * unit, cap)` until `max_attempts`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    unit: Duration,
    cap: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl LinearBackoff {
    pub fn new(unit: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            unit,
            cap,
            max_attempts,
            attempts: 0,
        }
    }

    /// Consecutive failures since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the ceiling has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Delay that follows `attempts` failures.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        self.unit.saturating_mul(attempts).min(self.cap)
    }
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(10), 5)
    }
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Records one failure. `None` once the ceiling is reached.
    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.is_exhausted() {
            return None;
        }
        Some(self.delay_for(self.attempts))
    }
}
