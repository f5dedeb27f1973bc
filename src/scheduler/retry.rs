//! Exponential backoff with jitter.
//!
//! `delay(attempt) = base * 2^attempt + uniform(0, jitter)`. For a non-zero
//! base the lower bound `base * 2^attempt` strictly increases with `attempt`
//! until it exceeds `Duration::MAX` (attempt 63 for a one-second base),
//! where it saturates. With the default one-second jitter ceiling every
//! delay lies in `[base * 2^attempt, base * 2^attempt + 1000ms)`.

use std::time::Duration;

use rand::RngExt;

/// Default base delay for the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Default exclusive upper bound of the random jitter.
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(1000);

/// Retry backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_jitter: Duration) -> Self {
        Self {
            base_delay,
            max_jitter,
        }
    }

    /// A policy without jitter.
    pub fn fixed(base_delay: Duration) -> Self {
        Self::new(base_delay, Duration::ZERO)
    }

    /// Deterministic part of the delay for `attempt`, saturating at
    /// `Duration::MAX`.
    pub fn lower_bound(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let mut delay = self.base_delay;
        for _ in 0..attempt {
            match delay.checked_mul(2) {
                Some(doubled) => delay = doubled,
                None => return Duration::MAX,
            }
        }
        delay
    }

    /// Wait before retry number `attempt + 1` (attempt counts from 0).
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..jitter_ms))
        };
        self.lower_bound(attempt).saturating_add(jitter)
    }
}

/// `base_ms * 2^attempt + uniform(0, 1000)` milliseconds.
pub fn backoff_delay(attempt: u32, base_ms: u64) -> Duration {
    RetryPolicy::new(Duration::from_millis(base_ms), DEFAULT_MAX_JITTER).delay(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_within_bounds() {
        for attempt in 0..6 {
            let lower = Duration::from_millis(1000 * (1 << attempt));
            for _ in 0..50 {
                let delay = backoff_delay(attempt, 1000);
                assert!(delay >= lower, "attempt {}: {:?} < {:?}", attempt, delay, lower);
                assert!(delay < lower + Duration::from_millis(1000));
            }
        }
    }

    #[test]
    fn test_lower_bound_strictly_increases() {
        let policy = RetryPolicy::default();
        // 2^63 seconds is the last doubling that fits in a Duration.
        for attempt in 0..63 {
            assert!(
                policy.lower_bound(attempt) < policy.lower_bound(attempt + 1),
                "attempt {}",
                attempt
            );
        }
        assert_eq!(policy.lower_bound(63), Duration::from_secs(1 << 63));
    }

    #[test]
    fn test_lower_bound_saturates() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.lower_bound(64), Duration::MAX);
        assert_eq!(policy.lower_bound(u32::MAX), Duration::MAX);
        assert_eq!(RetryPolicy::fixed(Duration::ZERO).lower_bound(40), Duration::ZERO);
    }

    #[test]
    fn test_consecutive_delays_increase() {
        // With base >= jitter, delay(n) < delay(n + 1) holds for every sample.
        let policy = RetryPolicy::default();
        for attempt in 0..8 {
            assert!(policy.delay(attempt) < policy.delay(attempt + 1));
        }
    }

    #[test]
    fn test_fixed_policy_is_deterministic() {
        let policy = RetryPolicy::fixed(Duration::from_millis(5));
        assert_eq!(policy.delay(0), Duration::from_millis(5));
        assert_eq!(policy.delay(3), Duration::from_millis(40));
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(u32::MAX), Duration::MAX);
    }
}
