//! Exponential retry backoff.

use std::time::Duration;

use formplug_core::defaults;

/// Delay schedule applied between failed attempts.
///
/// `delay_for_attempt(n)` is `base_delay * 2^(n-1)` capped at `max_delay`,
/// and zero for `n == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(defaults::JOB_BACKOFF_BASE_MS),
            max_delay: Duration::from_millis(defaults::JOB_BACKOFF_MAX_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Delay before the next execution, given the attempt count the job has
    /// after the failure was recorded.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        // 2^31 already overflows any sane base; clamp the shift.
        let shift = (attempt - 1).min(31);
        let factor = 1u32 << shift;
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}
