//! Stream consumer-group operations against the stub server

#![allow(clippy::uninlined_format_args)]

mod common;

use bitriver_redis::{GroupStart, RedisError, SubscribeOptions};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_group_delivers_entries_in_order() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, client) = common::start().await;

    let first = client.produce("orders", &[("sku", "a-1")]).await?;
    let second = client.produce("orders", &[("sku", "b-2")]).await?;
    client.ensure_group("orders", "workers").await?;

    let entries = client
        .consume("orders", "workers", "w1", 10, Duration::from_millis(100))
        .await?;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id, first);
    assert_eq!(entries[1].id, second);
    assert_eq!(entries[0].get_field("sku"), Some("a-1"));
    assert_eq!(entries[1].get_field("sku"), Some("b-2"));

    let acked = client
        .acknowledge("orders", "workers", vec![first, second])
        .await?;
    assert_eq!(acked, 2);

    Ok(())
}

#[tokio::test]
async fn test_end_to_end_chat() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, client) = common::start().await;

    client.ensure_group("chat:42", "readers").await?;
    client
        .produce("chat:42", &[("user", "alice"), ("msg", "hi")])
        .await?;

    let entries = client
        .consume("chat:42", "readers", "r1", 1, Duration::from_millis(100))
        .await?;
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(
        entry.fields,
        vec![
            ("user".to_string(), "alice".to_string()),
            ("msg".to_string(), "hi".to_string()),
        ]
    );

    let ids = vec![entry.id.clone()];
    assert_eq!(client.acknowledge("chat:42", "readers", ids.clone()).await?, 1);
    assert_eq!(client.acknowledge("chat:42", "readers", ids).await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_acknowledge_empty_ids_skips_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let (server, client) = common::start().await;

    assert_eq!(client.acknowledge("s", "g", Vec::new()).await?, 0);
    assert_eq!(server.command_count("XACK"), 0);

    Ok(())
}

#[tokio::test]
async fn test_consume_waits_for_block() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, client) = common::start().await;
    client.ensure_group("idle", "g").await?;

    let started = Instant::now();
    let entries = client
        .consume("idle", "g", "c", 10, Duration::from_millis(100))
        .await?;
    let elapsed = started.elapsed();

    assert!(entries.is_empty());
    assert!(elapsed >= Duration::from_millis(90), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "returned after {:?}", elapsed);

    Ok(())
}

#[tokio::test]
async fn test_consume_wakes_on_produce() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, client) = common::start().await;
    client.ensure_group("wake", "g").await?;

    let block = Duration::from_millis(100);
    let producer = client.clone();
    let produced = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        producer.produce("wake", &[("n", "1")]).await
    });

    let started = Instant::now();
    let entries = client.consume("wake", "g", "c", 10, block).await?;
    let elapsed = started.elapsed();

    let id = produced.await??;
    assert_eq!(entries.len(), 1, "no entry within the {:?} block", block);
    assert_eq!(entries[0].id, id);
    assert!(elapsed < block + Duration::from_millis(40), "returned after {:?}", elapsed);

    Ok(())
}

#[tokio::test]
async fn test_zero_block_returns_immediately() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, client) = common::start().await;
    client.ensure_group("empty", "g").await?;

    let started = Instant::now();
    let entries = client.consume("empty", "g", "c", 10, Duration::ZERO).await?;
    assert!(entries.is_empty());
    assert!(started.elapsed() < Duration::from_millis(500));

    Ok(())
}

#[tokio::test]
async fn test_consumers_share_a_group() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, client) = common::start().await;
    client.ensure_group("jobs", "g").await?;
    client.produce("jobs", &[("n", "1")]).await?;
    client.produce("jobs", &[("n", "2")]).await?;

    let a = client.consume("jobs", "g", "a", 1, Duration::ZERO).await?;
    let b = client.consume("jobs", "g", "b", 1, Duration::ZERO).await?;
    let rest = client.consume("jobs", "g", "c", 1, Duration::ZERO).await?;

    assert_eq!(a[0].get_field("n"), Some("1"));
    assert_eq!(b[0].get_field("n"), Some("2"));
    assert!(rest.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_ensure_group_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let (server, client) = common::start().await;

    client.ensure_group("events", "g").await?;
    client.ensure_group("events", "g").await?;
    assert_eq!(server.command_count("XGROUP"), 2);

    Ok(())
}

#[tokio::test]
async fn test_group_from_latest_skips_history() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, client) = common::start().await;

    client.produce("audit", &[("n", "old")]).await?;
    client
        .ensure_group_from("audit", "tail", GroupStart::Latest)
        .await?;
    client.produce("audit", &[("n", "new")]).await?;

    let entries = client
        .consume("audit", "tail", "c", 10, Duration::ZERO)
        .await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].get_field("n"), Some("new"));

    Ok(())
}

#[tokio::test]
async fn test_consume_unknown_group_is_server_error() {
    let (_server, client) = common::start().await;

    let err = client
        .consume("nowhere", "g", "c", 1, Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, RedisError::Server(_)));
    assert_eq!(err.server_code(), Some("NOGROUP"));
}

#[tokio::test]
async fn test_produce_requires_fields() {
    let (server, client) = common::start().await;

    let fields: [(&str, &str); 0] = [];
    let err = client.produce("s", &fields).await.unwrap_err();
    assert!(matches!(err, RedisError::Config(_)));
    assert_eq!(server.command_count("XADD"), 0);
}

#[tokio::test]
async fn test_subscription_receives_new_entries() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, client) = common::start().await;
    client.ensure_group("feed", "g").await?;

    let mut subscription = client.subscribe(
        "feed",
        "g",
        SubscribeOptions::default().with_block(Duration::from_millis(100)),
    );
    assert!(subscription.consumer().starts_with("consumer-"));

    for n in 0..3 {
        client.produce("feed", &[("n", n.to_string())]).await?;
    }

    let mut ids = Vec::new();
    for n in 0..3 {
        let entry = tokio::time::timeout(Duration::from_secs(2), subscription.next())
            .await?
            .expect("subscription should stay open");
        assert_eq!(entry.get_field("n"), Some(n.to_string().as_str()));
        ids.push(entry.id);
    }
    subscription.close();

    // Nothing was acknowledged on our behalf.
    assert_eq!(client.acknowledge("feed", "g", ids).await?, 3);

    Ok(())
}

#[tokio::test]
async fn test_subscription_auto_ack() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, client) = common::start().await;
    client.ensure_group("feed", "g").await?;

    let mut subscription = client.subscribe(
        "feed",
        "g",
        SubscribeOptions::default()
            .with_consumer("auditor")
            .with_block(Duration::from_millis(100))
            .with_auto_ack(true),
    );
    assert_eq!(subscription.consumer(), "auditor");

    client.produce("feed", &[("n", "1")]).await?;
    let entry = tokio::time::timeout(Duration::from_secs(2), subscription.next())
        .await?
        .expect("subscription should stay open");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.acknowledge("feed", "g", vec![entry.id]).await?, 0);

    Ok(())
}
