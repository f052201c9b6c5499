//! Error types for Redis operations

use std::io;
use thiserror::Error;

/// Result type for Redis operations
pub type RedisResult<T> = Result<T, RedisError>;

/// Comprehensive error type for Redis operations
#[derive(Error, Debug)]
pub enum RedisError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Address unreachable or transport handshake failed
    #[error("Dial error: {0}")]
    Dial(String),

    /// Reply framing could not be parsed
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server returned an error reply
    #[error("Server error: {0}")]
    Server(String),

    /// TLS configuration or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Socket read or write exceeded its timeout
    #[error("Operation timed out")]
    Timeout,

    /// The caller's deadline elapsed before the command completed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// No idle connection and the pool is at capacity
    #[error("Connection pool exhausted ({max_size} connections in use)")]
    PoolExhausted {
        /// Configured pool capacity
        max_size: usize,
    },

    /// Credentials rejected during the connection handshake
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Sentinel discovery error
    #[error("Sentinel error: {0}")]
    Sentinel(String),

    /// Type conversion error
    #[error("Type conversion error: {0}")]
    Type(String),

    /// Invalid configuration or arguments
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Unexpected response from server
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl RedisError {
    /// Transport-class failures that a fresh connection may not hit again.
    ///
    /// Application errors, authentication failures, pool exhaustion and
    /// deadlines are never retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Dial(_) | Self::Timeout | Self::Protocol(_)
        )
    }

    /// Whether the connection that produced this error must be destroyed
    /// rather than returned to the pool.
    ///
    /// A server error reply leaves the byte stream aligned, everything else
    /// that happens mid-command does not.
    #[must_use]
    pub const fn is_connection_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Server(_) | Self::Type(_) | Self::UnexpectedResponse(_)
        )
    }

    /// Check for the `BUSYGROUP` reply sent when a consumer group already exists
    #[must_use]
    pub fn is_busy_group(&self) -> bool {
        match self {
            Self::Server(msg) => msg.starts_with("BUSYGROUP"),
            _ => false,
        }
    }

    /// Error code of a server reply (the first word, e.g. `WRONGTYPE`)
    #[must_use]
    pub fn server_code(&self) -> Option<&str> {
        match self {
            Self::Server(msg) => msg.split_whitespace().next(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(RedisError::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_retryable());
        assert!(RedisError::Dial("refused".to_string()).is_retryable());
        assert!(RedisError::Timeout.is_retryable());
        assert!(RedisError::Protocol("bad prefix".to_string()).is_retryable());
    }

    #[test]
    fn test_terminal_errors_are_not_retryable() {
        assert!(!RedisError::Server("ERR wrong number of arguments".to_string()).is_retryable());
        assert!(!RedisError::Auth("WRONGPASS".to_string()).is_retryable());
        assert!(!RedisError::PoolExhausted { max_size: 4 }.is_retryable());
        assert!(!RedisError::DeadlineExceeded.is_retryable());
        assert!(!RedisError::Sentinel("no master".to_string()).is_retryable());
    }

    #[test]
    fn test_connection_fatal() {
        assert!(!RedisError::Server("ERR".to_string()).is_connection_fatal());
        assert!(RedisError::Timeout.is_connection_fatal());
        assert!(RedisError::Protocol("truncated".to_string()).is_connection_fatal());
        assert!(RedisError::DeadlineExceeded.is_connection_fatal());
    }

    #[test]
    fn test_busy_group() {
        let busy = RedisError::Server("BUSYGROUP Consumer Group name already exists".to_string());
        assert!(busy.is_busy_group());
        assert_eq!(busy.server_code(), Some("BUSYGROUP"));

        let other = RedisError::Server("ERR no such key".to_string());
        assert!(!other.is_busy_group());
        assert!(!RedisError::Timeout.is_busy_group());
    }
}
