//! High-level Redis client
//!
//! This module provides the main `Client` interface. Every command goes
//! through [`Client::run`] (or [`Client::run_until`] with a deadline), which
//! checks a connection out of the pool, sends the command, and retries
//! transport failures with jittered backoff.

use crate::commands::{Command, PingCommand};
use crate::connection::RedisConnection;
use crate::pool::{Pool, PoolStats, RedisConnectionManager};
use crate::retry::Backoff;
use crate::sentinel::Resolver;
use crate::tls::TlsConnector;
use bitriver_redis_core::{
    config::ConnectionConfig,
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

struct ClientInner {
    pool: Pool<RedisConnectionManager>,
    resolver: Arc<Resolver>,
    backoff: Backoff,
    max_retries: usize,
}

/// High-level Redis client
///
/// Automatically handles:
/// - Connection pooling with a fixed upper bound
/// - Primary discovery through sentinels, or rotation across candidates
/// - Retries of transport failures with jittered backoff
///
/// The handle is cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("resolver", &self.inner.resolver)
            .field("pool", &self.inner.pool.stats())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect to Redis with the given configuration
    ///
    /// Validates the configuration and, in sentinel mode, resolves the
    /// current primary. Connections themselves are dialed on first use.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use bitriver_redis::{Client, ConnectionConfig};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let config = ConnectionConfig::new("redis://localhost:6379");
    ///     let client = Client::connect(config).await?;
    ///     client.ping().await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn connect(config: ConnectionConfig) -> RedisResult<Self> {
        config.validate()?;

        let tls = config.tls.clone().map(TlsConnector::new).transpose()?;
        let resolver = Arc::new(Resolver::new(&config, tls.clone())?);

        if let Some(master_name) = resolver.master_name() {
            let addr = resolver.resolve().await?;
            info!("Using primary {} at {}", master_name, addr);
        }

        let max_size = config.pool.max_size;
        let backoff = Backoff::new(&config.retry);
        let max_retries = config.retry.max_retries;
        let manager = RedisConnectionManager::new(config, tls, Arc::clone(&resolver));

        Ok(Self {
            inner: Arc::new(ClientInner {
                pool: Pool::new(manager, max_size),
                resolver,
                backoff,
                max_retries,
            }),
        })
    }

    /// Execute a command with retries
    pub async fn run<C>(&self, command: C) -> RedisResult<C::Output>
    where
        C: Command + Send + Sync,
    {
        self.dispatch(&command, None).await
    }

    /// Execute a command with retries, giving up at `deadline`
    ///
    /// When the deadline passes, the in-flight connection is destroyed and
    /// [`RedisError::DeadlineExceeded`] is returned.
    pub async fn run_until<C>(&self, command: C, deadline: Instant) -> RedisResult<C::Output>
    where
        C: Command + Send + Sync,
    {
        self.dispatch(&command, Some(deadline)).await
    }

    /// Check that the server answers
    pub async fn ping(&self) -> RedisResult<()> {
        self.run(PingCommand).await
    }

    /// Current pool occupancy
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// The resolver choosing dial targets
    pub fn resolver(&self) -> &Resolver {
        &self.inner.resolver
    }

    async fn dispatch<C>(&self, command: &C, deadline: Option<Instant>) -> RedisResult<C::Output>
    where
        C: Command + Send + Sync,
    {
        let attempts = self.inner.max_retries + 1;
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.inner.backoff.next_delay();
                debug!(
                    "Retrying {} in {:?} (attempt {}/{})",
                    command.command_name(),
                    delay,
                    attempt + 1,
                    attempts
                );
                within(deadline, tokio::time::sleep(delay)).await?;
            }

            match within(deadline, self.attempt(command)).await? {
                Ok(reply) => return command.parse_response(reply),
                Err(e) if e.is_retryable() => {
                    debug!("{} failed: {}", command.command_name(), e);
                    self.inner.resolver.invalidate();
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RedisError::Config("Retry budget allows no attempts".to_string())
        }))
    }

    /// One round trip on one pooled connection
    async fn attempt<C>(&self, command: &C) -> RedisResult<RespValue>
    where
        C: Command + Send + Sync,
    {
        let mut conn = self.inner.pool.acquire().await?;
        let result = run_on(&mut conn, command).await;
        let healthy = match result {
            Ok(_) => true,
            Err(ref e) => !e.is_connection_fatal(),
        };
        conn.release(healthy);
        result
    }
}

async fn run_on<C: Command>(conn: &mut RedisConnection, command: &C) -> RedisResult<RespValue> {
    conn.execute_command_blocking(
        command.command_name(),
        &command.args(),
        command.block_duration(),
    )
    .await
}

async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> RedisResult<F::Output> {
    match deadline {
        Some(deadline) => timeout_at(deadline, fut)
            .await
            .map_err(|_| RedisError::DeadlineExceeded),
        None => Ok(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let err = Client::connect(ConnectionConfig::new("")).await.unwrap_err();
        assert!(matches!(err, RedisError::Config(_)));

        let err = Client::connect(ConnectionConfig::new("localhost").with_pool_size(0))
            .await
            .unwrap_err();
        assert!(matches!(err, RedisError::Config(_)));
    }

    #[tokio::test]
    async fn test_connect_is_lazy() {
        // Nothing listens on port 1; building the client must still succeed.
        let client = Client::connect(ConnectionConfig::new("redis://127.0.0.1:1"))
            .await
            .unwrap();
        let stats = client.pool_stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.checked_out, 0);
    }

    #[tokio::test]
    async fn test_expired_deadline() {
        let client = Client::connect(ConnectionConfig::new("redis://127.0.0.1:1"))
            .await
            .unwrap();
        let err = client
            .run_until(PingCommand, Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(err, RedisError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_dial_failures_exhaust_budget() {
        let config = ConnectionConfig::new("redis://127.0.0.1:1")
            .with_max_retries(2)
            .with_backoff(
                std::time::Duration::from_millis(1),
                std::time::Duration::from_millis(2),
            );
        let client = Client::connect(config).await.unwrap();
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, RedisError::Dial(_)));
        assert_eq!(client.pool_stats().checked_out, 0);
    }
}
