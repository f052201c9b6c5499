//! Helpers shared by the integration tests
//!
//! Every test runs against its own in-memory stub server, so tests never
//! share keys and need no external Redis.

#![allow(dead_code)]

use bitriver_redis::{Client, ConnectionConfig};
use bitriver_redis_stub::{Options, Server};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Install a log subscriber honouring `RUST_LOG`, once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Client settings for `server` with short timeouts and backoff
pub fn config_for(server: &Server) -> ConnectionConfig {
    ConnectionConfig::new(server.url())
        .with_connect_timeout(Duration::from_secs(1))
        .with_read_timeout(Duration::from_secs(2))
        .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
}

/// A fresh stub server and a client connected to it
pub async fn start() -> (Server, Client) {
    init_tracing();
    let server = Server::start(Options::default())
        .await
        .expect("stub server should start");
    let client = Client::connect(config_for(&server))
        .await
        .expect("client should connect");
    (server, client)
}
