//! Redelivery backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Redelivery delay, in seconds, after a failure observed at `retry_count`.
///
/// `base^retry_count`, so the first failure (`retry_count = 0`) waits one
/// second. There is no upper clamp here; callers bound `retry_count` through the
/// item's `max_retries`. Saturates at `u64::MAX` instead of overflowing.
pub fn compute_backoff_seconds(retry_count: u32, base: u64) -> u64 {
    base.saturating_pow(retry_count)
}

/// Backoff configuration shared by a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Exponent seed; values below 2 degrade to a constant one-second delay.
    pub base: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base: 4 }
    }
}

impl BackoffPolicy {
    pub fn new(base: u64) -> Self {
        Self { base }
    }

    pub fn delay_seconds(&self, retry_count: u32) -> u64 {
        compute_backoff_seconds(retry_count, self.base)
    }

    pub fn delay(&self, retry_count: u32) -> Duration {
        Duration::from_secs(self.delay_seconds(retry_count))
    }
}
