//! Backoff policy shared by every external call class.
//!
//! The policy is pure data plus arithmetic; the async executor that sleeps
//! and applies timeouts lives in the app crate.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry budget and backoff shape for one class of external call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of each delay randomised, in `[0, 1]`.
    pub jitter: f64,
    /// Bound on a single attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: 0.2,
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64, timeout_secs: u64) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            timeout: Duration::from_secs(timeout_secs),
            ..Self::default()
        }
    }

    /// No retries and no backoff. Used in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retry number `attempt` (1-based: the wait after the
    /// first failure is `delay_for(1, ..)`).
    ///
    /// `sample` is a uniform draw in `[0, 1)`; the result lies in
    /// `[d·(1 − jitter), d]` where `d = min(base · 2^(attempt−1), max)`.
    pub fn delay_for(&self, attempt: u32, sample: f64) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 - jitter * sample.clamp(0.0, 1.0);
        capped.mul_f64(factor)
    }
}
