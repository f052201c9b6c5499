//! Jittered backoff between command attempts

use bitriver_redis_core::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Uniformly random delay within fixed bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
}

impl Backoff {
    /// Bounds taken from the retry configuration, with defaults for zero
    /// values and inverted bounds swapped
    pub fn new(config: &RetryConfig) -> Self {
        let (min, max) = config.normalized_backoff();
        Self { min, max }
    }

    /// Delay before the next attempt
    pub fn next_delay(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }

    /// Lower bound
    pub fn min(&self) -> Duration {
        self.min
    }

    /// Upper bound
    pub fn max(&self) -> Duration {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitriver_redis_core::config::{DEFAULT_MAX_BACKOFF, DEFAULT_MIN_BACKOFF};

    #[test]
    fn test_delay_within_bounds() {
        let backoff = Backoff::new(&RetryConfig {
            max_retries: 3,
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        });
        for _ in 0..1000 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(40));
        }
    }

    #[test]
    fn test_zero_bounds_use_defaults() {
        let backoff = Backoff::new(&RetryConfig {
            max_retries: 0,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        });
        assert_eq!(backoff.min(), DEFAULT_MIN_BACKOFF);
        assert_eq!(backoff.max(), DEFAULT_MAX_BACKOFF);
    }

    #[test]
    fn test_inverted_bounds_are_swapped() {
        let backoff = Backoff::new(&RetryConfig {
            max_retries: 1,
            min_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_millis(100),
        });
        assert_eq!(backoff.min(), Duration::from_millis(100));
        assert_eq!(backoff.max(), Duration::from_millis(300));
        let delay = backoff.next_delay();
        assert!(delay >= backoff.min() && delay <= backoff.max());
    }

    #[test]
    fn test_equal_bounds_are_fixed() {
        let backoff = Backoff::new(&RetryConfig {
            max_retries: 1,
            min_backoff: Duration::from_millis(75),
            max_backoff: Duration::from_millis(75),
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(75));
    }
}
