//! Retry policy: decides backoff delays and the attempt ceiling.

use std::time::Duration;

/// Exponential backoff with a ceiling on delay and on attempts.
///
/// Used for transport retries of an inference call and for persistence
/// retries of an upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound of any single delay.
    pub max_delay: Duration,

    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Single attempt, no retry.
    pub fn never() -> Self {
        Self::new(Duration::ZERO, 1.0, Duration::ZERO, 1)
    }

    /// Delay after the `attempts`-th failed attempt (1-indexed).
    ///
    /// delay = base_delay * multiplier^(attempts - 1), capped at `max_delay`.
    ///
    /// Example with base_delay=1s, multiplier=2.0, max_delay=5s:
    /// - attempt 1: 1s
    /// - attempt 2: 2s
    /// - attempt 3: 4s
    /// - attempt 4: 5s (capped)
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    /// May another attempt follow the `attempts`-th one?
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    /// 1s base, doubling, capped at 60s, 3 attempts.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0, Duration::from_secs(60), 3)
    }
}
