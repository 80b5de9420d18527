//! Exponential backoff for re-delivered jobs.

use std::time::Duration;

use blockindex_core::config::QueueSettings;

/// Stateless retry policy. It computes the next delay given the attempt number.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per job, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Maximum backoff delay (caps exponential growth).
    pub max_backoff: Duration,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&QueueSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: settings.backoff(),
            max_backoff: settings.max_backoff(),
            multiplier: 2.0,
        }
    }

    /// Returns the delay before retrying a job that has failed `attempt` times
    /// (1-based), or `None` if the job is out of attempts.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }
        let base_ms = self.initial_backoff.as_millis() as f64
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base_ms.min(self.max_backoff.as_millis() as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// Returns `true` if attempts remain after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    #[test]
    fn delays_double() {
        let policy = policy(4);
        assert_eq!(policy.next_delay(1).unwrap().as_millis(), 100);
        assert_eq!(policy.next_delay(2).unwrap().as_millis(), 200);
        assert_eq!(policy.next_delay(3).unwrap().as_millis(), 400);
        assert!(policy.next_delay(4).is_none());
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy {
            max_backoff: Duration::from_millis(500),
            multiplier: 10.0,
            ..policy(10)
        };
        let d5 = policy.next_delay(5).unwrap();
        assert!(d5 <= Duration::from_millis(500), "d5={d5:?} exceeds max");
    }

    #[test]
    fn single_attempt_never_retries() {
        assert!(!policy(1).should_retry(1));
    }

    #[test]
    fn built_from_queue_settings() {
        let policy = RetryPolicy::from_settings(&QueueSettings::default());
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
        assert_eq!(policy.max_backoff, Duration::from_secs(30));
    }
}
