//! Command builders for Redis operations
//!
//! This module provides type-safe command builders. Each builder knows its
//! wire name, how to lay out its arguments and how to turn the reply into a
//! Rust value.

pub mod counter;
pub mod stream;

use bitriver_redis_core::{
    error::{RedisError, RedisResult},
    types::ServerAddr,
    value::RespValue,
};
use bytes::Bytes;
use std::time::Duration;

pub use counter::{ExpireCommand, IncrByCommand, IncrCommand, TtlCommand};
pub use stream::{XAckCommand, XAddCommand, XGroupCreateCommand, XReadGroupCommand};

/// Trait for commands that can be executed
pub trait Command {
    /// The return type of the command
    type Output;

    /// Get the command name
    fn command_name(&self) -> &str;

    /// Get the command arguments
    fn args(&self) -> Vec<Bytes>;

    /// Parse the response into the output type
    fn parse_response(&self, response: RespValue) -> RedisResult<Self::Output>;

    /// How long the server may hold the reply back (blocking reads)
    fn block_duration(&self) -> Duration {
        Duration::ZERO
    }
}

pub(crate) fn arg(value: impl AsRef<[u8]>) -> Bytes {
    Bytes::copy_from_slice(value.as_ref())
}

/// PING command builder
#[derive(Debug, Clone, Default)]
pub struct PingCommand;

impl Command for PingCommand {
    type Output = ();

    fn command_name(&self) -> &str {
        "PING"
    }

    fn args(&self) -> Vec<Bytes> {
        Vec::new()
    }

    fn parse_response(&self, response: RespValue) -> RedisResult<Self::Output> {
        match response {
            RespValue::SimpleString(ref s) if s == "PONG" => Ok(()),
            other => Err(RedisError::UnexpectedResponse(format!("{:?}", other))),
        }
    }
}

/// SENTINEL get-master-addr-by-name command builder
#[derive(Debug, Clone)]
pub struct SentinelMasterAddrCommand {
    master_name: String,
}

impl SentinelMasterAddrCommand {
    /// Create a new lookup for the named primary
    pub fn new(master_name: impl Into<String>) -> Self {
        Self {
            master_name: master_name.into(),
        }
    }
}

impl Command for SentinelMasterAddrCommand {
    /// `None` when the sentinel does not monitor a primary by that name
    type Output = Option<ServerAddr>;

    fn command_name(&self) -> &str {
        "SENTINEL"
    }

    fn args(&self) -> Vec<Bytes> {
        vec![
            Bytes::from_static(b"get-master-addr-by-name"),
            arg(&self.master_name),
        ]
    }

    fn parse_response(&self, response: RespValue) -> RedisResult<Self::Output> {
        if response.is_null() {
            return Ok(None);
        }
        let parts = response.into_array()?;
        if parts.len() != 2 {
            return Err(RedisError::UnexpectedResponse(format!(
                "Expected host and port, got {} elements",
                parts.len()
            )));
        }
        let host = parts[0].as_string()?;
        let port = parts[1]
            .as_int()
            .ok()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| {
                RedisError::UnexpectedResponse(format!("Invalid port: {:?}", parts[1]))
            })?;
        Ok(Some(ServerAddr::new(host, port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_command() {
        let cmd = PingCommand;
        assert_eq!(cmd.command_name(), "PING");
        assert!(cmd.args().is_empty());
        assert!(cmd
            .parse_response(RespValue::SimpleString("PONG".to_string()))
            .is_ok());
        assert!(cmd.parse_response(RespValue::Integer(1)).is_err());
    }

    #[test]
    fn test_sentinel_master_addr_command() {
        let cmd = SentinelMasterAddrCommand::new("mymaster");
        assert_eq!(cmd.command_name(), "SENTINEL");
        assert_eq!(
            cmd.args(),
            vec![Bytes::from("get-master-addr-by-name"), Bytes::from("mymaster")]
        );

        let reply = RespValue::Array(vec![
            RespValue::from("10.0.0.7"),
            RespValue::from("6380"),
        ]);
        assert_eq!(
            cmd.parse_response(reply).unwrap(),
            Some(ServerAddr::new("10.0.0.7", 6380))
        );
        assert_eq!(cmd.parse_response(RespValue::NullArray).unwrap(), None);
        assert_eq!(cmd.parse_response(RespValue::Null).unwrap(), None);
        assert!(cmd
            .parse_response(RespValue::Array(vec![RespValue::from("host")]))
            .is_err());
        assert!(cmd
            .parse_response(RespValue::Array(vec![
                RespValue::from("host"),
                RespValue::from("99999"),
            ]))
            .is_err());
    }
}
