//! Exponential reconnect backoff.

use std::time::Duration;

/// Bounded exponential backoff: `min(base * 2^(attempt-1), max)`.
///
/// The policy only computes delays. Whether another attempt is made is the
/// controller's decision; [`BackoffPolicy::should_retry`] is a convenience for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect attempt.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Number of consecutive failed attempts before giving up.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with explicit bounds.
    #[must_use]
    pub const fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
        }
    }

    /// Delay to wait before the given (1-based) attempt. Attempt 0 is treated as 1.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        1u32.checked_shl(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Whether another attempt may follow `attempts_made` consecutive failures.
    #[must_use]
    pub const fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
