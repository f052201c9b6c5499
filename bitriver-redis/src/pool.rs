//! Connection pooling
//!
//! A bounded pool of connections produced by a [`ManageConnection`]
//! implementation. The pool never waits for capacity: when every slot is in
//! use `acquire` fails with [`RedisError::PoolExhausted`].
//!
//! Pool state lives behind one `std::sync::Mutex` that is held only while
//! moving connections in and out of the idle list, never across an `.await`.
//! Dialing happens outside the lock after a slot has been reserved.

use crate::connection::RedisConnection;
use crate::sentinel::Resolver;
use crate::tls::TlsConnector;
use async_trait::async_trait;
use bitriver_redis_core::{
    config::ConnectionConfig,
    error::{RedisError, RedisResult},
};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, trace};

/// Creates and disposes of pooled connections
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    /// The connection type handed out by the pool
    type Connection: Send + 'static;

    /// Open a new connection
    async fn connect(&self) -> RedisResult<Self::Connection>;

    /// Whether an idle connection should be discarded instead of reused
    fn is_stale(&self, _conn: &Self::Connection) -> bool {
        false
    }

    /// Dispose of a connection that will not be reused
    fn destroy(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections waiting in the idle list
    pub idle: usize,
    /// Connections currently handed out
    pub checked_out: usize,
    /// Configured capacity
    pub max_size: usize,
}

struct IdleConnection<C> {
    conn: C,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    checked_out: usize,
}

struct PoolInner<M: ManageConnection> {
    manager: M,
    max_size: usize,
    state: Mutex<PoolState<M::Connection>>,
}

impl<M: ManageConnection> PoolInner<M> {
    fn lock(&self) -> MutexGuard<'_, PoolState<M::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checkin(&self, conn: M::Connection, created_at: Instant, healthy: bool) {
        let rejected = {
            let mut state = self.lock();
            state.checked_out = state.checked_out.saturating_sub(1);
            if healthy && state.idle.len() + state.checked_out < self.max_size {
                state.idle.push_back(IdleConnection {
                    conn,
                    created_at,
                    idle_since: Instant::now(),
                });
                None
            } else {
                Some(conn)
            }
        };

        if let Some(conn) = rejected {
            trace!("Destroying connection (healthy: {})", healthy);
            self.manager.destroy(conn);
        }
    }
}

/// Bounded connection pool
pub struct Pool<M: ManageConnection> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ManageConnection> Pool<M> {
    /// Create an empty pool; connections are dialed on demand
    pub fn new(manager: M, max_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                manager,
                max_size,
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(max_size),
                    checked_out: 0,
                }),
            }),
        }
    }

    /// Check out a connection
    ///
    /// Reuses an idle connection when one exists, otherwise dials a new one
    /// if the pool has room.
    pub async fn acquire(&self) -> RedisResult<PooledConnection<M>> {
        let (reused, stale) = self.take_idle();
        for conn in stale {
            self.inner.manager.destroy(conn);
        }
        if let Some(idle) = reused {
            trace!("Reusing connection idle for {:?}", idle.idle_since.elapsed());
            let mut conn = PooledConnection::new(Arc::clone(&self.inner), idle.conn, idle.created_at);
            conn.idle_since = Some(idle.idle_since);
            return Ok(conn);
        }

        self.try_reserve()?;

        match self.inner.manager.connect().await {
            Ok(conn) => {
                debug!("Opened pooled connection");
                Ok(PooledConnection::new(
                    Arc::clone(&self.inner),
                    conn,
                    Instant::now(),
                ))
            }
            Err(e) => {
                self.release_slot();
                Err(e)
            }
        }
    }

    /// Pop the most recently used idle connection, collecting stale ones
    fn take_idle(
        &self,
    ) -> (
        Option<IdleConnection<M::Connection>>,
        Vec<M::Connection>,
    ) {
        let mut stale = Vec::new();
        let mut state = self.inner.lock();
        while let Some(idle) = state.idle.pop_back() {
            if self.inner.manager.is_stale(&idle.conn) {
                stale.push(idle.conn);
                continue;
            }
            state.checked_out += 1;
            return (Some(idle), stale);
        }
        (None, stale)
    }

    fn try_reserve(&self) -> RedisResult<()> {
        let mut state = self.inner.lock();
        if state.idle.len() + state.checked_out >= self.inner.max_size {
            return Err(RedisError::PoolExhausted {
                max_size: self.inner.max_size,
            });
        }
        state.checked_out += 1;
        Ok(())
    }

    fn release_slot(&self) {
        let mut state = self.inner.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
    }

    /// Current occupancy
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            idle: state.idle.len(),
            checked_out: state.checked_out,
            max_size: self.inner.max_size,
        }
    }

    /// Destroy every idle connection
    pub fn clear_idle(&self) {
        let drained: Vec<_> = self.inner.lock().idle.drain(..).collect();
        for idle in drained {
            self.inner.manager.destroy(idle.conn);
        }
    }

    /// The connection manager
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }
}

/// A checked-out connection
///
/// Call [`release`](Self::release) to hand it back. Dropping it without a
/// release destroys the connection, which is what happens when the future
/// using it is cancelled mid-command.
pub struct PooledConnection<M: ManageConnection> {
    pool: Arc<PoolInner<M>>,
    conn: Option<M::Connection>,
    created_at: Instant,
    idle_since: Option<Instant>,
}

impl<M: ManageConnection> PooledConnection<M> {
    fn new(pool: Arc<PoolInner<M>>, conn: M::Connection, created_at: Instant) -> Self {
        Self {
            pool,
            conn: Some(conn),
            created_at,
            idle_since: None,
        }
    }

    /// Return the connection to the pool, or destroy it when not healthy
    pub fn release(mut self, healthy: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn, self.created_at, healthy);
        }
    }

    /// When the underlying connection was established
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the connection was last parked in the idle list, `None` if it
    /// was dialed for this checkout
    pub fn idle_since(&self) -> Option<Instant> {
        self.idle_since
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `release` and `drop` take the connection, and both consume self.
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn, self.created_at, false);
        }
    }
}

/// Dials Redis connections to the address chosen by a [`Resolver`]
pub struct RedisConnectionManager {
    config: ConnectionConfig,
    tls: Option<TlsConnector>,
    resolver: Arc<Resolver>,
}

impl RedisConnectionManager {
    /// Create a manager that dials whatever address the resolver reports
    pub fn new(config: ConnectionConfig, tls: Option<TlsConnector>, resolver: Arc<Resolver>) -> Self {
        Self {
            config,
            tls,
            resolver,
        }
    }

    /// The resolver used to pick dial targets
    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }
}

#[async_trait]
impl ManageConnection for RedisConnectionManager {
    type Connection = RedisConnection;

    async fn connect(&self) -> RedisResult<RedisConnection> {
        let addr = self.resolver.current().await?;
        RedisConnection::connect(&addr, &self.config, self.tls.as_ref()).await
    }

    fn is_stale(&self, conn: &RedisConnection) -> bool {
        self.resolver
            .cached()
            .is_some_and(|addr| &addr != conn.addr())
    }
}
