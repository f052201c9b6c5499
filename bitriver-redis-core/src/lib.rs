//! Core types and traits for the bitriver Redis client
//!
//! This crate provides the RESP2 codec, the reply value type, the error
//! taxonomy and the configuration structures shared by the client and its
//! test server.

#![deny(warnings)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;
pub mod value;

pub use config::{ConnectionConfig, PoolConfig, RetryConfig, SentinelConfig, TlsConfig};
pub use error::{RedisError, RedisResult};
pub use protocol::{FrameReader, RespDecoder, RespEncoder};
pub use types::ServerAddr;
pub use value::RespValue;
