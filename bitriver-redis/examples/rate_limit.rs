//! Fixed-window rate limiting with counters
//!
//! Runs against `REDIS_URL` when set, otherwise against an in-memory stub.

use bitriver_redis::{Client, ConnectionConfig, RateDecision};
use bitriver_redis_stub::{Options, Server};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let stub = Server::start(Options::default()).await?;
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| stub.url());
    let client = Client::connect(ConnectionConfig::new(url)).await?;

    for request in 1..=5 {
        match client.allow("rl:alice", 3, Duration::from_secs(10)).await? {
            RateDecision::Allowed => println!("request {}: allowed", request),
            RateDecision::Limited { retry_after } => {
                println!("request {}: limited, retry in {:?}", request, retry_after);
            }
        }
    }

    println!("hits: {}", client.increment("rl:total").await?);
    client.set_expiry("rl:total", Duration::from_secs(60)).await?;
    println!("expires in {}s", client.time_to_live("rl:total").await?);

    stub.close().await;
    Ok(())
}
