//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure reconnect backoff.
use std::time;

#[derive(Clone, Debug)]
/// A retry policy to determine how long to wait between failed connection attempts, and when to
/// stop trying.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval after the first failed attempt.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between attempts.
    pub maximum_interval: Option<time::Duration>,
    /// Number of consecutive failed attempts after which we give up.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine the interval to wait after `attempt` consecutive failures.
    /// The first failure waits `initial_interval`, every further failure multiplies it by
    /// `backoff_coefficient`, up to `maximum_interval`.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.initial_interval.checked_mul(factor));

        match (candidate_interval, self.maximum_interval) {
            (Some(interval), Some(max_interval)) => std::cmp::min(interval, max_interval),
            (Some(interval), None) => interval,
            (None, Some(max_interval)) => max_interval,
            (None, None) => time::Duration::MAX,
        }
    }

    /// Whether `attempt` consecutive failures exhaust this policy.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
    pub max_attempts: u32,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(2),
            maximum_interval: Some(time::Duration::from_secs(60)),
            max_attempts: 5,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> RetryPolicyBuilder {
        self.max_attempts = max_attempts;
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            max_attempts: self.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_doubles_from_two_seconds() {
        let retry_policy = RetryPolicy::default();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_secs(8));
        assert_eq!(retry_policy.retry_interval(4), time::Duration::from_secs(16));
        assert_eq!(retry_policy.retry_interval(5), time::Duration::from_secs(32));
        assert_eq!(retry_policy.retry_interval(6), time::Duration::from_secs(60));
    }

    #[test]
    fn test_retry_interval_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(2))
            .maximum_interval(time::Duration::from_secs(4))
            .provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_secs(4));
        // Large attempt counts overflow the multiplication and fall back to the maximum.
        assert_eq!(retry_policy.retry_interval(200), time::Duration::from_secs(4));
    }

    #[test]
    fn test_constant_retry_interval() {
        let retry_policy = RetryPolicy::build(1, time::Duration::from_millis(50)).provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_millis(50));
        assert_eq!(retry_policy.retry_interval(7), time::Duration::from_millis(50));
    }

    #[test]
    fn test_is_exhausted() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(1))
            .max_attempts(3)
            .provide();

        assert!(!retry_policy.is_exhausted(0));
        assert!(!retry_policy.is_exhausted(2));
        assert!(retry_policy.is_exhausted(3));
        assert!(retry_policy.is_exhausted(4));
    }
}
