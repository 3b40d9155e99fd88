//! Redis collection integration tests.
//!
//! Run with: cargo test --test storage_redis --features redis -- --ignored --nocapture
//!
//! Requires: REDIS_URI env var or Redis on localhost:6379
//!
//! Note: Tests use unique feed name prefixes to avoid data conflicts between runs.

mod collections;

use std::time::Duration;

use thoonk::config::{StoreConfig, StoreType};
use thoonk::interfaces::{Command, Connector, Store, StoreExt};
use thoonk::storage::RedisConnector;
use thoonk::{Collection, Config, Registry};

fn redis_uri() -> String {
    std::env::var("REDIS_URI").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn test_prefix() -> String {
    format!(
        "test_{}",
        uuid::Uuid::new_v4().to_string().replace("-", "")[..8].to_string()
    )
}

fn redis_config() -> Config {
    let mut config = Config::default();
    config.store = StoreConfig {
        store_type: StoreType::Redis,
        ..StoreConfig::default()
    };
    config.store.redis.url = redis_uri();
    config
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_collections() {
    println!("=== Redis collection tests ===");
    println!("Connecting to: {}", redis_uri());

    let prefix = test_prefix();
    println!("Using test prefix: {}", prefix);

    let registry = Registry::connect(&redis_config())
        .await
        .expect("Failed to connect to Redis");

    run_collection_tests!(&registry, &prefix);

    println!("=== All Redis collection tests PASSED ===");
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_exec_aborts_on_watched_write() {
    let connector = RedisConnector::new(&redis_uri()).expect("client");
    let ours = connector.connect().await.expect("connect");
    let theirs = connector.connect().await.expect("connect");
    let key = format!("{}.watched", test_prefix());

    ours.watch(&[key.clone()]).await.unwrap();
    theirs
        .query(Command::Set {
            key: key.clone(),
            value: "theirs".to_string(),
        })
        .await
        .unwrap();

    let result = ours
        .exec(vec![Command::Set {
            key: key.clone(),
            value: "ours".to_string(),
        }])
        .await
        .unwrap();
    assert!(result.is_none(), "EXEC must abort after a watched write");
    assert_eq!(ours.get(&key).await.unwrap().as_deref(), Some("theirs"));

    ours.query(Command::Del(vec![key])).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_two_registries_share_feeds() {
    let prefix = test_prefix();
    let config = redis_config();
    let producer = Registry::connect(&config).await.expect("producer");
    let consumer = Registry::connect(&config).await.expect("consumer");
    let name = format!("{}.shared", prefix);

    let jobs = producer.job(&name, None).await.unwrap();
    let waiter = jobs.publish_with_result("work", None, false).await.unwrap();

    let worker = consumer.job(&name, None).await.unwrap();
    let job = worker
        .get(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("job visible to the other registry");
    worker.finish(&job.id, Some("done")).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), waiter.wait())
        .await
        .expect("result within timeout")
        .unwrap();
    assert_eq!(result, "done");

    jobs.delete().await.unwrap();
    assert!(!consumer.exists(&name).await.unwrap());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_blocked_get_does_not_stall_other_handles() {
    let prefix = test_prefix();
    let registry = Registry::connect(&redis_config()).await.expect("registry");
    let idle = registry.queue(&format!("{}.idle", prefix), None).await.unwrap();
    let jobs = registry.job(&format!("{}.jobs", prefix), None).await.unwrap();

    let waiting = idle.clone();
    let blocked = tokio::spawn(async move { waiting.get(Duration::ZERO).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    jobs.put("frame").await.unwrap();
    let job = tokio::time::timeout(Duration::from_secs(2), jobs.get(Duration::from_secs(1)))
        .await
        .expect("job get not held up by the blocked queue")
        .unwrap()
        .expect("job claimed");
    assert_eq!(job.item, "frame");

    blocked.abort();
    jobs.delete().await.unwrap();
    idle.delete().await.unwrap();
}
