//! Reconnect delay policies.
//!
//! After a connection drops, the hub connection asks its [`RetryPolicy`] how
//! long to wait before each attempt. Returning `None` gives up and the
//! connection stops for good.

use std::time::Duration;

/// Decides the delay before each reconnect attempt.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// Delay before attempt number `retry_count` (starting at 0), or `None`
    /// to stop reconnecting.
    fn next_retry_interval(&self, retry_count: u32) -> Option<Duration>;
}

/// Delays used by [`DefaultRetryPolicy`]: immediately, then 2, 10 and 30 seconds.
pub const DEFAULT_RETRY_DELAYS: [Duration; 4] = [
    Duration::ZERO,
    Duration::from_secs(2),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

/// Retries four times with growing delays, then gives up.
#[derive(Debug, Clone, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn next_retry_interval(&self, retry_count: u32) -> Option<Duration> {
        DEFAULT_RETRY_DELAYS.get(retry_count as usize).copied()
    }
}

/// Retries with an explicit list of delays, one per attempt.
#[derive(Debug, Clone)]
pub struct FixedDelayRetryPolicy {
    delays: Vec<Duration>,
}

impl FixedDelayRetryPolicy {
    /// Use `delays[n]` before attempt `n`; give up after the last one.
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }
}

impl RetryPolicy for FixedDelayRetryPolicy {
    fn next_retry_interval(&self, retry_count: u32) -> Option<Duration> {
        self.delays.get(retry_count as usize).copied()
    }
}

/// Exponential backoff: doubles from `initial` up to `max`, optionally
/// bounded in attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    initial: Duration,
    max: Duration,
    max_attempts: Option<u32>,
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ExponentialBackoffPolicy {
    /// Backoff from `initial` doubling up to `max`, retrying forever.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            max_attempts: None,
        }
    }

    /// Give up after `attempts` retries.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn next_retry_interval(&self, retry_count: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| retry_count >= max) {
            return None;
        }
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }
}

/// Never reconnects. Behaves like building the connection without a retry
/// policy: the first transport loss stops it.
#[derive(Debug, Clone, Default)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn next_retry_interval(&self, _retry_count: u32) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_gives_up_after_four() {
        let policy = DefaultRetryPolicy;
        assert_eq!(policy.next_retry_interval(0), Some(Duration::ZERO));
        assert_eq!(policy.next_retry_interval(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_retry_interval(3), Some(Duration::from_secs(30)));
        assert_eq!(policy.next_retry_interval(4), None);
    }

    #[test]
    fn test_exponential_backoff_caps_at_max() {
        let policy = ExponentialBackoffPolicy::default();
        assert_eq!(policy.next_retry_interval(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_retry_interval(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_retry_interval(4), Some(Duration::from_secs(16)));
        assert_eq!(policy.next_retry_interval(5), Some(Duration::from_secs(30)));
        assert_eq!(policy.next_retry_interval(200), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_exponential_backoff_attempt_limit() {
        let policy =
            ExponentialBackoffPolicy::new(Duration::from_millis(10), Duration::from_secs(1))
                .max_attempts(2);
        assert!(policy.next_retry_interval(1).is_some());
        assert!(policy.next_retry_interval(2).is_none());
    }

    #[test]
    fn test_fixed_delays() {
        let policy = FixedDelayRetryPolicy::new(vec![Duration::from_millis(5)]);
        assert_eq!(policy.next_retry_interval(0), Some(Duration::from_millis(5)));
        assert_eq!(policy.next_retry_interval(1), None);
    }

    #[test]
    fn test_no_retry() {
        assert_eq!(NoRetryPolicy.next_retry_interval(0), None);
    }
}
