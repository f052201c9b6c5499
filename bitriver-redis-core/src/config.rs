//! Configuration types for Redis connections

use crate::error::{RedisError, RedisResult};
use crate::types::ServerAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default lower bound for the jittered retry delay
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(50);

/// Default upper bound for the jittered retry delay
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Configuration for connection pooling
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections, idle and checked out combined
    pub max_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_size: 16 }
    }
}

/// Retry budget and backoff bounds for the command facade
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = `max_retries + 1`)
    pub max_retries: usize,
    /// Lower bound of the jittered delay between attempts
    pub min_backoff: Duration,
    /// Upper bound of the jittered delay between attempts
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryConfig {
    /// Backoff bounds with zero values replaced by defaults and inverted
    /// bounds swapped
    #[must_use]
    pub fn normalized_backoff(&self) -> (Duration, Duration) {
        let min = if self.min_backoff.is_zero() {
            DEFAULT_MIN_BACKOFF
        } else {
            self.min_backoff
        };
        let max = if self.max_backoff.is_zero() {
            DEFAULT_MAX_BACKOFF
        } else {
            self.max_backoff
        };
        if min > max {
            (max, min)
        } else {
            (min, max)
        }
    }
}

/// TLS settings for encrypted transports
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Path to a PEM bundle of trusted CA certificates
    pub ca_cert_path: Option<PathBuf>,
    /// In-memory PEM bundle of trusted CA certificates
    pub ca_cert_pem: Option<Vec<u8>>,
    /// Server name for SNI and verification (defaults to the address host)
    pub server_name: Option<String>,
}

impl TlsConfig {
    /// TLS verified against the bundled web PKI roots
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust the CA certificates in the given PEM file
    #[must_use]
    pub fn with_ca_cert(mut self, path: impl AsRef<Path>) -> Self {
        self.ca_cert_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Trust the CA certificates in the given PEM bytes
    #[must_use]
    pub fn with_ca_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ca_cert_pem = Some(pem.into());
        self
    }

    /// Set the server name used for SNI and certificate verification
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Configuration for sentinel-based primary discovery
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    /// Name of the monitored primary
    pub master_name: String,
    /// Discovery endpoints, queried in order
    pub sentinels: Vec<ServerAddr>,
    /// Password for the discovery endpoints, if they require one
    pub password: Option<String>,
}

impl SentinelConfig {
    /// Create a new sentinel configuration
    #[must_use]
    pub fn new(master_name: impl Into<String>) -> Self {
        Self {
            master_name: master_name.into(),
            sentinels: Vec::new(),
            password: None,
        }
    }

    /// Add a sentinel endpoint given as `host:port`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn add_sentinel(mut self, addr: impl AsRef<str>) -> RedisResult<Self> {
        self.sentinels.push(ServerAddr::parse(addr.as_ref())?);
        Ok(self)
    }

    /// Add an already parsed sentinel endpoint
    #[must_use]
    pub fn with_sentinel(mut self, addr: ServerAddr) -> Self {
        self.sentinels.push(addr);
        self
    }

    /// Set sentinel password
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// Configuration for Redis connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection string (e.g., `<redis://localhost:6379>` or `<redis://host1:6379,host2:6379>`)
    pub connection_string: String,

    /// Optional ACL username, sent with the password
    pub username: Option<String>,

    /// Optional password for authentication
    pub password: Option<String>,

    /// Database number selected after authentication
    pub database: u8,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Socket read timeout for a single reply
    pub read_timeout: Duration,

    /// Socket write timeout for a single command
    pub write_timeout: Duration,

    /// Enable TCP keepalive
    pub tcp_keepalive: Option<Duration>,

    /// Transport encryption; `rediss://` connection strings enable it
    pub tls: Option<TlsConfig>,

    /// Pool configuration
    pub pool: PoolConfig,

    /// Retry configuration
    pub retry: RetryConfig,

    /// Sentinel configuration for high availability
    pub sentinel: Option<SentinelConfig>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_string: "redis://localhost:6379".to_string(),
            username: None,
            password: None,
            database: 0,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            tcp_keepalive: Some(Duration::from_secs(60)),
            tls: None,
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            sentinel: None,
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration with the given connection string
    pub fn new(connection_string: impl Into<String>) -> Self {
        let connection_string = connection_string.into();
        let tls = connection_string
            .trim()
            .starts_with("rediss://")
            .then(TlsConfig::new);
        Self {
            connection_string,
            tls,
            ..Default::default()
        }
    }

    /// Create a new connection config that discovers the primary through sentinels
    #[must_use]
    pub fn new_with_sentinel(sentinel_config: SentinelConfig) -> Self {
        Self {
            connection_string: String::new(),
            sentinel: Some(sentinel_config),
            ..Default::default()
        }
    }

    /// Set the password for authentication
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set username and password for ACL authentication
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the database number
    #[must_use]
    pub const fn with_database(mut self, database: u8) -> Self {
        self.database = database;
        self
    }

    /// Set the connection timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the read timeout
    #[must_use]
    pub const fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the write timeout
    #[must_use]
    pub const fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Enable TLS with the given settings
    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Set the maximum pool size
    #[must_use]
    pub const fn with_pool_size(mut self, max_size: usize) -> Self {
        self.pool.max_size = max_size;
        self
    }

    /// Set the retry budget
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    /// Set the jittered backoff bounds
    #[must_use]
    pub const fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.retry.min_backoff = min;
        self.retry.max_backoff = max;
        self
    }

    /// Set the sentinel configuration
    #[must_use]
    pub fn with_sentinel(mut self, sentinel: SentinelConfig) -> Self {
        self.sentinel = Some(sentinel);
        self
    }

    /// Parse connection endpoints from connection string
    ///
    /// # Errors
    ///
    /// Returns an error if any endpoint is malformed.
    pub fn parse_endpoints(&self) -> RedisResult<Vec<ServerAddr>> {
        let conn_str = self.connection_string.trim();
        let addr_part = conn_str
            .strip_prefix("redis://")
            .or_else(|| conn_str.strip_prefix("rediss://"))
            .unwrap_or(conn_str);
        let addr_part = addr_part.trim_end_matches('/');

        addr_part
            .split(',')
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
            .map(ServerAddr::parse)
            .collect()
    }

    /// Check the configuration for values that can never work
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Config`] describing the first problem found.
    pub fn validate(&self) -> RedisResult<()> {
        if self.pool.max_size == 0 {
            return Err(RedisError::Config("Pool size must be at least 1".to_string()));
        }
        match &self.sentinel {
            Some(sentinel) => {
                if sentinel.master_name.trim().is_empty() {
                    return Err(RedisError::Config("Sentinel master name is empty".to_string()));
                }
                if sentinel.sentinels.is_empty() {
                    return Err(RedisError::Config("No sentinels configured".to_string()));
                }
            }
            None => {
                if self.parse_endpoints()?.is_empty() {
                    return Err(RedisError::Config("No endpoints specified".to_string()));
                }
            }
        }
        if self.username.is_some() && self.password.is_none() {
            return Err(RedisError::Config(
                "A username requires a password".to_string(),
            ));
        }
        Ok(())
    }
}
