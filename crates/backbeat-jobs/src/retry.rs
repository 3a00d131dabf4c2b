//! Backoff policies for retried jobs.

use backbeat_config::RetryConfig;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

pub use backbeat_config::BackoffStrategy as RetryStrategy;

/// Retry backoff configuration.
///
/// How many attempts a job gets is decided per job by `max_attempts`; the
/// policy only decides how long a retried job waits before it may be claimed
/// again.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retry strategy.
    pub strategy: RetryStrategy,

    /// Initial delay in milliseconds.
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,

    /// Backoff multiplier (for exponential).
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0). Up to this fraction of the delay is added.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Failed jobs are immediately claimable again.
    pub fn none() -> Self {
        Self {
            strategy: RetryStrategy::None,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Creates a fixed delay retry policy.
    pub fn fixed(delay: Duration) -> Self {
        let delay_ms = duration_ms(delay);
        Self {
            strategy: RetryStrategy::Fixed,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Creates an exponential backoff retry policy.
    pub fn exponential() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            initial_delay_ms: 1000,  // 1 second
            max_delay_ms: 600_000, // 10 minutes
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Creates a linear backoff retry policy.
    pub fn linear(increment: Duration) -> Self {
        let increment_ms = duration_ms(increment);
        Self {
            strategy: RetryStrategy::Linear,
            initial_delay_ms: increment_ms,
            max_delay_ms: increment_ms.saturating_mul(10),
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = duration_ms(delay);
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = duration_ms(delay);
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enables jitter.
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Delay before a job that has used `attempts` attempts may run again.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        if attempts == 0 || self.strategy == RetryStrategy::None {
            return Duration::ZERO;
        }

        let base_delay = match self.strategy {
            RetryStrategy::None => 0,
            RetryStrategy::Fixed => self.initial_delay_ms,
            RetryStrategy::Exponential => {
                let exp = i32::try_from(attempts - 1).unwrap_or(i32::MAX);
                let delay = self.initial_delay_ms as f64 * self.multiplier.powi(exp);
                if delay.is_finite() && delay < u64::MAX as f64 {
                    delay as u64
                } else {
                    u64::MAX
                }
            }
            RetryStrategy::Linear => self.initial_delay_ms.saturating_mul(u64::from(attempts)),
        };

        let capped_delay = base_delay.min(self.max_delay_ms);

        let final_delay = if self.jitter_factor > 0.0 {
            let jitter_range = (capped_delay as f64 * self.jitter_factor) as u64;
            capped_delay.saturating_add(rand_jitter(jitter_range))
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay)
    }

    /// Earliest claim time for a retry, or `None` when retries are immediate.
    pub fn next_run_at(&self, attempts: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let delay = self.delay_for_attempt(attempts);
        if delay.is_zero() {
            return None;
        }
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            strategy: config.strategy,
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            multiplier: config.multiplier,
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn rand_jitter(range: u64) -> u64 {
    if range == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_immediate_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.strategy, RetryStrategy::None);
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.next_run_at(3, Utc::now()), None);
    }

    #[test]
    fn test_fixed_retry() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(5000));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::exponential().without_jitter();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::linear(Duration::from_secs(1));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3000));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_delay(Duration::from_secs(10))
            .without_jitter();

        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let policy = RetryPolicy::exponential()
            .with_initial_delay(Duration::from_secs(10))
            .with_jitter(0.5);

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(15));
        }
    }

    #[test]
    fn test_next_run_at_offsets_now() {
        let policy = RetryPolicy::fixed(Duration::from_secs(30));
        let now = Utc::now();
        assert_eq!(
            policy.next_run_at(1, now),
            Some(now + chrono::Duration::seconds(30))
        );
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            strategy: RetryStrategy::Exponential,
            initial_delay_ms: 250,
            max_delay_ms: 1000,
            multiplier: 3.0,
            jitter_factor: 0.0,
        };
        let policy = RetryPolicy::from(&config);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(750));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1000));
    }
}
