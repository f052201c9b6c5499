//! Stream consumer-group walkthrough
//!
//! Runs against `REDIS_URL` when set, otherwise against an in-memory stub.

use bitriver_redis::{Client, ConnectionConfig, SubscribeOptions};
use bitriver_redis_stub::{Options, Server};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let stub = match std::env::var("REDIS_URL") {
        Ok(_) => None,
        Err(_) => Some(Server::start(Options::default()).await?),
    };
    let url = match stub {
        Some(ref server) => server.url(),
        None => std::env::var("REDIS_URL")?,
    };

    let client = Client::connect(ConnectionConfig::new(url)).await?;
    client.ensure_group("chat:42", "readers").await?;

    // One-shot read
    let id = client
        .produce("chat:42", &[("user", "alice"), ("msg", "hi")])
        .await?;
    println!("Produced {}", id);

    let entries = client
        .consume("chat:42", "readers", "reader-1", 10, Duration::from_millis(500))
        .await?;
    for entry in &entries {
        println!(
            "{} says {:?}",
            entry.get_field("user").unwrap_or("?"),
            entry.get_field("msg")
        );
    }
    let ids = entries.into_iter().map(|entry| entry.id).collect();
    println!("Acknowledged {}", client.acknowledge("chat:42", "readers", ids).await?);

    // Background subscription
    let mut subscription = client.subscribe(
        "chat:42",
        "readers",
        SubscribeOptions::default()
            .with_block(Duration::from_millis(200))
            .with_auto_ack(true),
    );
    for msg in ["how are you?", "bye"] {
        client.produce("chat:42", &[("user", "bob"), ("msg", msg)]).await?;
    }
    for _ in 0..2 {
        if let Some(entry) = subscription.next().await {
            println!("{} received {}", subscription.consumer(), entry.id);
        }
    }
    subscription.close();

    if let Some(server) = stub {
        server.close().await;
    }
    Ok(())
}
