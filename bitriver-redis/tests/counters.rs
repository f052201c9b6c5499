//! Counter, expiry and rate-limit operations against the stub server

#![allow(clippy::uninlined_format_args)]

mod common;

use bitriver_redis::{RateDecision, RedisError};
use std::time::Duration;

#[tokio::test]
async fn test_increment_counts_up() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, client) = common::start().await;

    assert_eq!(client.increment("hits").await?, 1);
    assert_eq!(client.increment("hits").await?, 2);
    assert_eq!(client.increment("hits").await?, 3);

    Ok(())
}

#[tokio::test]
async fn test_expiry_and_time_to_live() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, client) = common::start().await;

    client.increment("session").await?;
    assert_eq!(client.time_to_live("session").await?, -1);

    assert!(client.set_expiry("session", Duration::from_secs(1)).await?);
    let ttl = client.time_to_live("session").await?;
    assert!((0..=1).contains(&ttl), "ttl was {}", ttl);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(client.time_to_live("session").await?, -2);
    assert_eq!(client.increment("session").await?, 1);

    Ok(())
}

#[tokio::test]
async fn test_missing_key_has_no_time_to_live() -> Result<(), Box<dyn std::error::Error>> {
    let (server, client) = common::start().await;

    assert_eq!(client.time_to_live("ghost").await?, -2);
    assert_eq!(client.time_to_live("ghost").await?, -2);
    assert_eq!(server.command_count("TTL"), 2);

    Ok(())
}

#[tokio::test]
async fn test_set_expiry_creates_missing_key() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, client) = common::start().await;

    assert!(client.set_expiry("fresh", Duration::from_secs(5)).await?);
    let ttl = client.time_to_live("fresh").await?;
    assert!((0..=5).contains(&ttl), "ttl was {}", ttl);

    // Created at zero, so the next increment counts from there.
    assert_eq!(client.increment("fresh").await?, 1);
    assert!((0..=5).contains(&client.time_to_live("fresh").await?));

    Ok(())
}

#[tokio::test]
async fn test_set_expiry_keeps_existing_value() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, client) = common::start().await;

    client.increment("visits").await?;
    client.increment("visits").await?;
    assert!(client.set_expiry("visits", Duration::from_secs(30)).await?);
    assert_eq!(client.increment("visits").await?, 3);

    Ok(())
}

#[tokio::test]
async fn test_sub_second_expiry_rounds_up() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, client) = common::start().await;

    client.increment("short").await?;
    assert!(client.set_expiry("short", Duration::from_millis(200)).await?);
    assert_eq!(client.time_to_live("short").await?, 1);

    Ok(())
}

#[tokio::test]
async fn test_increment_on_stream_key_is_server_error() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, client) = common::start().await;

    client.produce("mixed", &[("a", "1")]).await?;
    let err = client.increment("mixed").await.unwrap_err();
    assert!(matches!(err, RedisError::Server(_)));
    assert_eq!(err.server_code(), Some("WRONGTYPE"));

    Ok(())
}

#[tokio::test]
async fn test_allow_limits_within_window() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, client) = common::start().await;
    let window = Duration::from_secs(10);

    for _ in 0..3 {
        assert_eq!(client.allow("rl:alice", 3, window).await?, RateDecision::Allowed);
    }

    match client.allow("rl:alice", 3, window).await? {
        RateDecision::Limited { retry_after } => {
            assert!(retry_after <= window);
            assert!(retry_after >= Duration::from_secs(9));
        }
        RateDecision::Allowed => panic!("fourth request should be limited"),
    }

    // Other keys are counted separately.
    assert!(client.allow("rl:bob", 3, window).await?.is_allowed());

    Ok(())
}

#[tokio::test]
async fn test_allow_resets_after_window() -> Result<(), Box<dyn std::error::Error>> {
    let (_server, client) = common::start().await;
    let window = Duration::from_secs(1);

    assert!(client.allow("rl:burst", 1, window).await?.is_allowed());
    assert!(!client.allow("rl:burst", 1, window).await?.is_allowed());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(client.allow("rl:burst", 1, window).await?.is_allowed());

    Ok(())
}
