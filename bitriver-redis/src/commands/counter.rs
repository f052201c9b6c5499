//! Counter command builders

use super::{arg, Command};
use bitriver_redis_core::{error::RedisResult, value::RespValue};
use bytes::Bytes;
use std::time::Duration;

/// INCR command builder
pub struct IncrCommand {
    key: String,
}

impl IncrCommand {
    /// Create a new INCR command
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Command for IncrCommand {
    type Output = i64;

    fn command_name(&self) -> &str {
        "INCR"
    }

    fn args(&self) -> Vec<Bytes> {
        vec![arg(&self.key)]
    }

    fn parse_response(&self, response: RespValue) -> RedisResult<Self::Output> {
        response.as_int()
    }
}

/// INCRBY command builder
pub struct IncrByCommand {
    key: String,
    delta: i64,
}

impl IncrByCommand {
    /// Create a new INCRBY command
    pub fn new(key: impl Into<String>, delta: i64) -> Self {
        Self {
            key: key.into(),
            delta,
        }
    }
}

impl Command for IncrByCommand {
    type Output = i64;

    fn command_name(&self) -> &str {
        "INCRBY"
    }

    fn args(&self) -> Vec<Bytes> {
        vec![arg(&self.key), Bytes::from(self.delta.to_string())]
    }

    fn parse_response(&self, response: RespValue) -> RedisResult<Self::Output> {
        response.as_int()
    }
}

/// EXPIRE command builder
pub struct ExpireCommand {
    key: String,
    seconds: u64,
}

impl ExpireCommand {
    /// Create a new EXPIRE command; partial seconds round up
    pub fn new(key: impl Into<String>, duration: Duration) -> Self {
        let seconds = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
        Self {
            key: key.into(),
            seconds,
        }
    }

    /// Expiry in whole seconds as sent on the wire
    pub fn seconds(&self) -> u64 {
        self.seconds
    }
}

impl Command for ExpireCommand {
    type Output = bool;

    fn command_name(&self) -> &str {
        "EXPIRE"
    }

    fn args(&self) -> Vec<Bytes> {
        vec![arg(&self.key), Bytes::from(self.seconds.to_string())]
    }

    fn parse_response(&self, response: RespValue) -> RedisResult<Self::Output> {
        Ok(response.as_int()? == 1)
    }
}

/// TTL command builder
pub struct TtlCommand {
    key: String,
}

impl TtlCommand {
    /// Create a new TTL command
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Command for TtlCommand {
    /// Seconds remaining; `-1` without expiry, `-2` for a missing key
    type Output = i64;

    fn command_name(&self) -> &str {
        "TTL"
    }

    fn args(&self) -> Vec<Bytes> {
        vec![arg(&self.key)]
    }

    fn parse_response(&self, response: RespValue) -> RedisResult<Self::Output> {
        response.as_int()
    }
}
