//! Common types used throughout the library

use crate::error::{RedisError, RedisResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Port used when an address omits one
pub const DEFAULT_PORT: u16 = 6379;

/// Host and port of a Redis server or sentinel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddr {
    /// Host name or IP literal (without IPv6 brackets)
    pub host: String,
    /// Port number
    pub port: u16,
}

impl ServerAddr {
    /// Create a new server address
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`
    ///
    /// # Errors
    ///
    /// Returns an error if the host is empty or the port is not a number.
    pub fn parse(input: &str) -> RedisResult<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RedisError::Config("Empty address".to_string()));
        }

        if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| RedisError::Config(format!("Unclosed IPv6 bracket: {input}")))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port, input)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(RedisError::Config(format!("Invalid address: {input}"))),
            };
            return Ok(Self::new(host, port));
        }

        match input.rsplit_once(':') {
            // A bare IPv6 literal has several colons and no port
            Some((host, _)) if host.contains(':') => Ok(Self::new(input, DEFAULT_PORT)),
            Some((host, port)) if !host.is_empty() => Ok(Self::new(host, parse_port(port, input)?)),
            Some(_) => Err(RedisError::Config(format!("Missing host: {input}"))),
            None => Ok(Self::new(input, DEFAULT_PORT)),
        }
    }

    /// Whether the host is an IP literal rather than a DNS name
    #[must_use]
    pub fn is_ip_literal(&self) -> bool {
        self.host.parse::<std::net::IpAddr>().is_ok()
    }
}

fn parse_port(port: &str, input: &str) -> RedisResult<u16> {
    port.parse::<u16>()
        .map_err(|_| RedisError::Config(format!("Invalid port in address: {input}")))
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddr {
    type Err = RedisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let addr = ServerAddr::parse("cache.internal:6380").unwrap();
        assert_eq!(addr, ServerAddr::new("cache.internal", 6380));
        assert_eq!(addr.to_string(), "cache.internal:6380");
        assert!(!addr.is_ip_literal());
    }

    #[test]
    fn test_parse_default_port() {
        let addr: ServerAddr = "localhost".parse().unwrap();
        assert_eq!(addr.port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_ipv6() {
        let addr = ServerAddr::parse("[::1]:7000").unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.port, 7000);
        assert_eq!(addr.to_string(), "[::1]:7000");
        assert!(addr.is_ip_literal());

        let bare = ServerAddr::parse("::1").unwrap();
        assert_eq!(bare.port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(ServerAddr::parse("").is_err());
        assert!(ServerAddr::parse("host:notaport").is_err());
        assert!(ServerAddr::parse(":6379").is_err());
        assert!(ServerAddr::parse("[::1").is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let addr = ServerAddr::new("10.0.0.5", 26379);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, r#"{"host":"10.0.0.5","port":26379}"#);
        let back: ServerAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
