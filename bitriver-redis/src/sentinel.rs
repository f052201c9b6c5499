//! Primary address resolution
//!
//! The [`Resolver`] decides which server new connections are dialed to.
//!
//! - **Static mode**: a list of candidate addresses from the connection
//!   string. The first is used until a transport failure, after which the
//!   next candidate is tried.
//! - **Sentinel mode**: the primary is discovered by asking each configured
//!   sentinel `SENTINEL get-master-addr-by-name <name>` in order. The answer
//!   is cached until a transport failure invalidates it.
//!
//! # Examples
//!
//! ```no_run
//! use bitriver_redis::{Client, ConnectionConfig, SentinelConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let sentinel_config = SentinelConfig::new("mymaster")
//!     .add_sentinel("127.0.0.1:26379")?
//!     .add_sentinel("127.0.0.1:26380")?
//!     .with_password("sentinel_password");
//!
//! let config = ConnectionConfig::new_with_sentinel(sentinel_config);
//! let client = Client::connect(config).await?;
//! client.increment("visits").await?;
//! # Ok(())
//! # }
//! ```

use crate::commands::{Command, SentinelMasterAddrCommand};
use crate::connection::RedisConnection;
use crate::tls::TlsConnector;
use bitriver_redis_core::{
    config::{ConnectionConfig, SentinelConfig},
    error::{RedisError, RedisResult},
    types::ServerAddr,
};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

enum Topology {
    Static(Vec<ServerAddr>),
    Sentinel(SentinelConfig),
}

#[derive(Default)]
struct ResolverState {
    cached: Option<ServerAddr>,
    next_candidate: usize,
}

/// Picks the address new connections are dialed to
pub struct Resolver {
    topology: Topology,
    sentinel_dial: ConnectionConfig,
    tls: Option<TlsConnector>,
    state: Mutex<ResolverState>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("master_name", &self.master_name())
            .field("cached", &self.cached())
            .finish_non_exhaustive()
    }
}

impl Resolver {
    /// Build a resolver from the client configuration
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Config`] when there is nothing to resolve.
    pub fn new(config: &ConnectionConfig, tls: Option<TlsConnector>) -> RedisResult<Self> {
        let topology = match config.sentinel {
            Some(ref sentinel) => {
                if sentinel.sentinels.is_empty() {
                    return Err(RedisError::Config("No sentinels configured".to_string()));
                }
                Topology::Sentinel(sentinel.clone())
            }
            None => {
                let candidates = config.parse_endpoints()?;
                if candidates.is_empty() {
                    return Err(RedisError::Config("No endpoints specified".to_string()));
                }
                Topology::Static(candidates)
            }
        };

        // Sentinels authenticate with their own password and have no databases.
        let mut sentinel_dial = config.clone();
        sentinel_dial.username = None;
        sentinel_dial.password = config.sentinel.as_ref().and_then(|s| s.password.clone());
        sentinel_dial.database = 0;

        let state = match topology {
            Topology::Static(ref candidates) => ResolverState {
                cached: candidates.first().cloned(),
                next_candidate: 0,
            },
            Topology::Sentinel(_) => ResolverState::default(),
        };

        Ok(Self {
            topology,
            sentinel_dial,
            tls,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ResolverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Name of the monitored primary in sentinel mode
    pub fn master_name(&self) -> Option<&str> {
        match self.topology {
            Topology::Sentinel(ref sentinel) => Some(&sentinel.master_name),
            Topology::Static(_) => None,
        }
    }

    /// The last resolved address, if still valid
    pub fn cached(&self) -> Option<ServerAddr> {
        self.lock().cached.clone()
    }

    /// The address to dial, resolving it first if nothing is cached
    pub async fn current(&self) -> RedisResult<ServerAddr> {
        if let Some(addr) = self.cached() {
            return Ok(addr);
        }
        self.resolve().await
    }

    /// Resolve the target address now and cache it
    pub async fn resolve(&self) -> RedisResult<ServerAddr> {
        let addr = match self.topology {
            Topology::Static(ref candidates) => {
                let state = self.lock();
                candidates[state.next_candidate % candidates.len()].clone()
            }
            Topology::Sentinel(ref sentinel) => self.query_sentinels(sentinel).await?,
        };

        self.lock().cached = Some(addr.clone());
        Ok(addr)
    }

    /// Forget the cached address after a transport failure
    ///
    /// In static mode this moves on to the next candidate; in sentinel mode
    /// the next dial asks the sentinels again.
    pub fn invalidate(&self) {
        let mut state = self.lock();
        match self.topology {
            Topology::Static(ref candidates) => {
                state.next_candidate = (state.next_candidate + 1) % candidates.len();
                let next = candidates[state.next_candidate].clone();
                debug!("Switching to candidate {}", next);
                state.cached = Some(next);
            }
            Topology::Sentinel(_) => {
                if let Some(old) = state.cached.take() {
                    debug!("Invalidated cached primary {}", old);
                }
            }
        }
    }

    async fn query_sentinels(&self, sentinel: &SentinelConfig) -> RedisResult<ServerAddr> {
        let mut last_error = None;

        for endpoint in &sentinel.sentinels {
            match self.ask_sentinel(endpoint, &sentinel.master_name).await {
                Ok(Some(addr)) => {
                    info!(
                        "Sentinel {} reports primary {} at {}",
                        endpoint, sentinel.master_name, addr
                    );
                    return Ok(addr);
                }
                Ok(None) => {
                    debug!(
                        "Sentinel {} does not know primary {}",
                        endpoint, sentinel.master_name
                    );
                }
                Err(e) => {
                    warn!("Sentinel {} unavailable: {}", endpoint, e);
                    last_error = Some(e);
                }
            }
        }

        let detail = last_error.map_or_else(String::new, |e| format!(" (last error: {e})"));
        Err(RedisError::Sentinel(format!(
            "No sentinel returned an address for primary {}{}",
            sentinel.master_name, detail
        )))
    }

    async fn ask_sentinel(
        &self,
        endpoint: &ServerAddr,
        master_name: &str,
    ) -> RedisResult<Option<ServerAddr>> {
        let mut conn =
            RedisConnection::connect(endpoint, &self.sentinel_dial, self.tls.as_ref()).await?;
        let cmd = SentinelMasterAddrCommand::new(master_name);
        let reply = conn
            .execute_command(cmd.command_name(), &cmd.args())
            .await?;
        cmd.parse_response(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_rotation() {
        let config = ConnectionConfig::new("redis://a:1,b:2,c:3");
        let resolver = Resolver::new(&config, None).unwrap();

        assert_eq!(resolver.master_name(), None);
        assert_eq!(resolver.current().await.unwrap(), ServerAddr::new("a", 1));

        resolver.invalidate();
        assert_eq!(resolver.current().await.unwrap(), ServerAddr::new("b", 2));
        resolver.invalidate();
        assert_eq!(resolver.current().await.unwrap(), ServerAddr::new("c", 3));
        resolver.invalidate();
        assert_eq!(resolver.resolve().await.unwrap(), ServerAddr::new("a", 1));
    }

    #[test]
    fn test_sentinel_requires_endpoints() {
        let config = ConnectionConfig::new_with_sentinel(SentinelConfig::new("primary"));
        assert!(matches!(
            Resolver::new(&config, None),
            Err(RedisError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_sentinel_unreachable_names_primary() {
        // Port 1 on loopback refuses connections.
        let sentinel = SentinelConfig::new("orders-primary")
            .add_sentinel("127.0.0.1:1")
            .unwrap();
        let config = ConnectionConfig::new_with_sentinel(sentinel)
            .with_connect_timeout(std::time::Duration::from_millis(200));
        let resolver = Resolver::new(&config, None).unwrap();

        assert!(resolver.cached().is_none());
        let err = resolver.current().await.unwrap_err();
        match err {
            RedisError::Sentinel(msg) => assert!(msg.contains("orders-primary")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
