//! Atomic counters with expiry
//!
//! Thin wrappers over `INCR`, `INCRBY`, `EXPIRE` and `TTL`, plus a
//! fixed-window rate limiter built from them.

use crate::client::Client;
use crate::commands::{ExpireCommand, IncrByCommand, IncrCommand, TtlCommand};
use bitriver_redis_core::error::RedisResult;
use std::time::Duration;
use tracing::trace;

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The request fits in the current window
    Allowed,
    /// The limit is reached; the window resets after the given delay
    Limited {
        /// Time until the window resets
        retry_after: Duration,
    },
}

impl RateDecision {
    /// Whether the request may proceed
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

impl Client {
    /// Increment the counter at `key` and return the new value
    ///
    /// A missing or expired key counts from 0.
    pub async fn increment(&self, key: &str) -> RedisResult<i64> {
        self.run(IncrCommand::new(key)).await
    }

    /// Expire `key` after `duration`, rounded up to whole seconds
    ///
    /// A missing key is created at 0 first, so the expiry always lands.
    /// Returns whether the server applied it.
    pub async fn set_expiry(&self, key: &str, duration: Duration) -> RedisResult<bool> {
        self.run(IncrByCommand::new(key, 0)).await?;
        self.run(ExpireCommand::new(key, duration)).await
    }

    /// Seconds until `key` expires
    ///
    /// `-1` means the key has no expiry and `-2` that it does not exist.
    pub async fn time_to_live(&self, key: &str) -> RedisResult<i64> {
        self.run(TtlCommand::new(key)).await
    }

    /// Count one request against `key` in a fixed window
    ///
    /// The first request of a window starts it; once more than `limit`
    /// requests have been counted the remaining window is reported.
    pub async fn allow(&self, key: &str, limit: u64, window: Duration) -> RedisResult<RateDecision> {
        let window = window.max(Duration::from_secs(1));

        let count = self.increment(key).await?;
        if count == 1 {
            self.run(ExpireCommand::new(key, window)).await?;
        }
        if u64::try_from(count).map_or(true, |count| count <= limit) {
            return Ok(RateDecision::Allowed);
        }

        let ttl = self.time_to_live(key).await?;
        trace!("Rate limit hit for {} (count {}, ttl {})", key, count, ttl);
        let retry_after = u64::try_from(ttl)
            .map(Duration::from_secs)
            .unwrap_or(window);
        Ok(RateDecision::Limited { retry_after })
    }
}
