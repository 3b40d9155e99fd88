//! Collection scenarios against the in-process store.
//!
//! Run with: cargo test --test scenarios
//!
//! Besides the shared collection tests, covers behaviour only the memory
//! store can provoke deterministically: a concurrent write landing between
//! WATCH and EXEC.

mod collections;

use std::sync::Arc;
use std::time::Duration;

use thoonk::config::RetryConfig;
use thoonk::interfaces::Command;
use thoonk::storage::MemoryStore;
use thoonk::{Collection, Config, Error, EventKind, Registry};

use collections::collection_tests::next_event;

async fn memory_registry(config: &Config) -> (MemoryStore, Arc<Registry>) {
    let store = MemoryStore::new();
    let registry = Registry::with_connector(Arc::new(store.clone()), config)
        .await
        .expect("memory registry");
    (store, registry)
}

#[tokio::test]
async fn test_memory_collections() {
    println!("=== Memory collection tests ===");
    let (_store, registry) = memory_registry(&Config::for_test()).await;

    run_collection_tests!(&registry, "scenario");

    println!("=== All memory collection tests PASSED ===");
}

#[tokio::test]
async fn test_publish_retries_transparently() {
    let (store, registry) = memory_registry(&Config::for_test()).await;
    let feed = registry.feed("contended", None).await.unwrap();
    let mut sub = feed.subscribe(&EventKind::FEED).await.unwrap();

    // Another process publishes between our WATCH and EXEC.
    store.interfere(
        "feed.ids:contended",
        vec![
            Command::ZAdd {
                key: "feed.ids:contended".to_string(),
                score: 1.0,
                member: "theirs".to_string(),
                nx: true,
            },
            Command::HSet {
                key: "feed.items:contended".to_string(),
                field: "theirs".to_string(),
                value: "from elsewhere".to_string(),
            },
        ],
    );

    let id = feed.publish("mine", None).await.expect("publish despite conflict");

    assert_eq!(store.aborted_transactions(), 1);
    assert_eq!(feed.get_ids().await.unwrap(), vec!["theirs".to_string(), id.clone()]);

    // Exactly one notification for our publish.
    let event = next_event(&mut sub).await;
    assert_eq!(event.kind(), EventKind::Publish);
    assert_eq!(event.id(), id);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_bounded_retry_surfaces_contention() {
    let config = Config {
        retry: RetryConfig {
            max_attempts: Some(1),
            ..RetryConfig::default()
        },
        ..Config::for_test()
    };
    let (store, registry) = memory_registry(&config).await;
    let jobs = registry.job("contended", None).await.unwrap();
    let id = jobs.put("x").await.unwrap();
    jobs.get(Duration::from_millis(50)).await.unwrap().expect("job");

    store.interfere(
        "feed.claimed:contended",
        vec![Command::ZAdd {
            key: "feed.claimed:contended".to_string(),
            score: 1.0,
            member: "other".to_string(),
            nx: false,
        }],
    );

    let err = jobs.finish(&id, None).await.unwrap_err();
    assert!(matches!(err, Error::ContentionExhausted { attempts: 1 }));
    // Nothing was applied; the job can still be finished.
    jobs.finish(&id, None).await.expect("finish after contention clears");
}

#[tokio::test]
async fn test_store_outage_is_a_connectivity_error() {
    let (store, registry) = memory_registry(&Config::for_test()).await;
    let feed = registry.feed("news", None).await.unwrap();

    store.set_offline(true);
    let err = feed.publish("x", None).await.unwrap_err();
    assert!(err.is_connectivity());
    assert!(!registry.runner().lock().is_locked());

    store.set_offline(false);
    feed.publish("x", None).await.expect("publish after recovery");
}
