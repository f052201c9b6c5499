//! Resilient async Redis client for Rust
//!
//! `bitriver-redis` speaks RESP2 over TCP or TLS and is built for moving
//! events between producers and consumers: stream consumer groups for
//! at-least-once delivery, and counters with expiry for rate limiting.
//!
//! # Features
//!
//! - Bounded connection pool that fails fast instead of queueing
//! - Primary discovery through sentinels, with re-resolution after failures
//! - Retries of transport failures with jittered backoff and deadlines
//! - Stream queue operations: produce, ensure group, consume, acknowledge
//! - Counters: increment, expiry, time-to-live and a fixed-window limiter
//! - Async/await support with Tokio
//!
//! # Quick Start
//!
//! ```no_run
//! use bitriver_redis::{Client, ConnectionConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConnectionConfig::new("redis://localhost:6379");
//!     let client = Client::connect(config).await?;
//!
//!     client.ensure_group("chat:42", "readers").await?;
//!     let id = client.produce("chat:42", &[("user", "alice"), ("msg", "hi")]).await?;
//!     println!("Produced {}", id);
//!
//!     let hits = client.increment("rl:alice").await?;
//!     client.set_expiry("rl:alice", Duration::from_secs(60)).await?;
//!     println!("Hits: {}", hits);
//!
//!     Ok(())
//! }
//! ```

#![deny(warnings)]
#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::future_not_send)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod commands;
pub mod connection;
pub mod counters;
pub mod pool;
pub mod retry;
pub mod sentinel;
pub mod streams;
pub mod tls;

pub use bitriver_redis_core::protocol;

pub use client::Client;
pub use counters::RateDecision;
pub use pool::{ManageConnection, Pool, PoolStats, PooledConnection};
pub use streams::{GroupStart, StreamEntry, SubscribeOptions, Subscription};

pub use bitriver_redis_core::{
    config::{ConnectionConfig, PoolConfig, RetryConfig, SentinelConfig, TlsConfig},
    error::{RedisError, RedisResult},
    types::ServerAddr,
    value::RespValue,
};
