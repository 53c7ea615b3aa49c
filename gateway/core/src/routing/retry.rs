//! Retry Classification and Backoff
//!
//! The dispatcher owns the retry loop; this module only answers two questions:
//! is this error worth another attempt, and how long to wait before it.
//!
//! ```text
//! delay(i) = min(max_delay, base_delay * 2^i) + U(0, jitter_ratio) * that
//! ```
//!
//! `i` is the 0-based retry index: the wait before the second attempt uses
//! `i = 0`.

use std::time::Duration;

use rand::Rng;

use crate::backend::BackendErrorKind;

/// Outcome of classifying an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Transient; try again after a backoff
    Retryable,
    /// Permanent; dead-letter without further attempts
    Fatal,
}

/// Backoff and attempt limits
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap on the exponential part
    pub max_delay: Duration,
    /// Total tries including the first
    pub max_attempts: u32,
    /// Upper bound of the random extra, as a fraction of the capped delay
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 3,
            jitter_ratio: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Set the base delay
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the delay cap
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the attempt limit
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the jitter ratio (0 disables jitter)
    #[must_use]
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Classify a backend error
    #[must_use]
    pub fn classify(&self, kind: BackendErrorKind) -> RetryDecision {
        match kind {
            BackendErrorKind::Timeout
            | BackendErrorKind::RateLimited
            | BackendErrorKind::Unavailable => RetryDecision::Retryable,
            BackendErrorKind::Malformed | BackendErrorKind::AuthFailed => RetryDecision::Fatal,
        }
    }

    /// Whether another try is allowed after `attempts_made`
    #[must_use]
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Capped exponential delay for retry index `retry`, without jitter
    #[must_use]
    pub fn capped_delay(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Delay before retry index `retry`, jitter included
    #[must_use]
    pub fn next_delay(&self, retry: u32) -> Duration {
        let capped = self.capped_delay(retry);
        if self.jitter_ratio <= 0.0 {
            return capped;
        }
        let fraction = rand::thread_rng().gen_range(0.0..=self.jitter_ratio);
        capped + capped.mul_f64(fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.classify(BackendErrorKind::Timeout), RetryDecision::Retryable);
        assert_eq!(policy.classify(BackendErrorKind::RateLimited), RetryDecision::Retryable);
        assert_eq!(policy.classify(BackendErrorKind::Unavailable), RetryDecision::Retryable);
        assert_eq!(policy.classify(BackendErrorKind::Malformed), RetryDecision::Fatal);
        assert_eq!(policy.classify(BackendErrorKind::AuthFailed), RetryDecision::Fatal);
    }

    #[test]
    fn test_delays_non_decreasing_up_to_cap() {
        let policy = RetryPolicy::default().with_jitter_ratio(0.0);
        let delays: Vec<_> = (0..10).map(|i| policy.next_delay(i)).collect();

        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[5], Duration::from_secs(32));
        assert_eq!(delays[6], Duration::from_secs(60));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= policy.max_delay));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::default();
        for retry in 0..8 {
            let capped = policy.capped_delay(retry);
            for _ in 0..50 {
                let delay = policy.next_delay(retry);
                assert!(delay >= capped);
                assert!(delay <= capped.mul_f64(1.5));
            }
        }
    }

    #[test]
    fn test_jittered_delays_still_grow_below_cap() {
        // base * 2^i * 1.5 < base * 2^(i+1)
        let policy = RetryPolicy::default();
        for retry in 0..4 {
            for _ in 0..20 {
                assert!(policy.next_delay(retry) < policy.capped_delay(retry + 1));
            }
        }
    }

    #[test]
    fn test_huge_retry_index_saturates() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.capped_delay(64), policy.max_delay);
        assert_eq!(policy.capped_delay(31), policy.max_delay);
    }

    #[test]
    fn test_attempt_limit() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_another(1));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
    }
}
