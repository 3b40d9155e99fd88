//! Collection contract tests.
//!
//! Feed names carry a caller-supplied prefix so that runs against a shared
//! server never see each other's data.

use std::sync::Arc;
use std::time::Duration;

use thoonk::{Collection, Error, Event, EventKind, FeedConfig, Position, Registry, Subscription};

const SHORT: Duration = Duration::from_millis(100);

pub async fn next_event(sub: &mut Subscription) -> Event {
    tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("event within timeout")
        .expect("subscription open")
}

// =============================================================================
// Feed
// =============================================================================

/// publish a, publish b, ids in order; retract the first, one left.
pub async fn test_feed_publish_and_retract(registry: &Arc<Registry>, prefix: &str) {
    let feed = registry
        .feed(&format!("{}.feed", prefix), None)
        .await
        .expect("open feed");

    let id1 = feed.publish("a", None).await.expect("publish a");
    let id2 = feed.publish("b", None).await.expect("publish b");
    assert_eq!(feed.get_ids().await.unwrap(), vec![id1.clone(), id2.clone()]);

    feed.retract(&id1).await.expect("retract");
    assert_eq!(feed.get_ids().await.unwrap(), vec![id2]);
    assert!(matches!(
        feed.retract(&id1).await,
        Err(Error::DoesNotExist { .. })
    ));
}

/// Republishing an existing id is an edit; a fresh id is a publish.
pub async fn test_feed_edit_vs_publish(registry: &Arc<Registry>, prefix: &str) {
    let feed = registry
        .feed(&format!("{}.edits", prefix), None)
        .await
        .expect("open feed");
    let mut sub = feed.subscribe(&EventKind::FEED).await.expect("subscribe");

    feed.publish("v1", Some("item")).await.unwrap();
    feed.publish("v2", Some("item")).await.unwrap();
    feed.publish("other", Some("fresh")).await.unwrap();

    let kinds: Vec<(EventKind, String)> = {
        let mut kinds = Vec::new();
        for _ in 0..3 {
            let event = next_event(&mut sub).await;
            kinds.push((event.kind(), event.id().to_string()));
        }
        kinds
    };
    assert_eq!(
        kinds,
        vec![
            (EventKind::Publish, "item".to_string()),
            (EventKind::Edit, "item".to_string()),
            (EventKind::Publish, "fresh".to_string()),
        ]
    );
    assert_eq!(feed.get_item("item").await.unwrap().as_deref(), Some("v2"));
}

/// Never more than `max_length` ids, one retract per eviction, before the
/// publish that caused it.
pub async fn test_feed_max_length(registry: &Arc<Registry>, prefix: &str) {
    let feed = registry
        .feed(
            &format!("{}.bounded", prefix),
            Some(FeedConfig::default().with_max_length(3)),
        )
        .await
        .expect("open feed");
    let mut sub = feed
        .subscribe(&[EventKind::Publish, EventKind::Retract])
        .await
        .expect("subscribe");

    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(feed.publish(&n.to_string(), None).await.unwrap());
        assert!(feed.get_ids().await.unwrap().len() <= 3);
    }
    assert_eq!(feed.get_ids().await.unwrap(), ids[2..].to_vec());

    let mut seen = Vec::new();
    for _ in 0..7 {
        let event = next_event(&mut sub).await;
        seen.push((event.kind(), event.id().to_string()));
    }
    assert_eq!(seen[3], (EventKind::Retract, ids[0].clone()));
    assert_eq!(seen[4], (EventKind::Publish, ids[3].clone()));
    assert_eq!(seen[5], (EventKind::Retract, ids[1].clone()));
    assert_eq!(seen[6], (EventKind::Publish, ids[4].clone()));
}

// =============================================================================
// SortedFeed
// =============================================================================

/// append a, b, c; move c to the beginning.
pub async fn test_sorted_feed_move_begin(registry: &Arc<Registry>, prefix: &str) {
    let feed = registry
        .sorted_feed(&format!("{}.sorted", prefix), None)
        .await
        .expect("open sorted feed");
    let mut sub = feed.subscribe(&[EventKind::Position]).await.expect("subscribe");

    let id1 = feed.append("a").await.unwrap();
    let id2 = feed.append("b").await.unwrap();
    let id3 = feed.append("c").await.unwrap();
    feed.move_begin(&id3).await.expect("move");

    assert_eq!(feed.get_ids().await.unwrap(), vec![id3.clone(), id1, id2]);

    let mut last = None;
    for _ in 0..4 {
        last = Some(next_event(&mut sub).await);
    }
    assert_eq!(
        last,
        Some(Event::Position {
            feed: format!("{}.sorted", prefix),
            id: id3,
            position: Position::Begin,
        })
    );
}

// =============================================================================
// Queue
// =============================================================================

pub async fn test_queue_roundtrip(registry: &Arc<Registry>, prefix: &str) {
    let queue = registry
        .queue(&format!("{}.queue", prefix), None)
        .await
        .expect("open queue");

    queue.put("one").await.unwrap();
    queue.put("two").await.unwrap();
    queue.publish("urgent", true).await.unwrap();

    let mut items = Vec::new();
    while let Some((_, item)) = queue.get(SHORT).await.unwrap() {
        items.push(item);
    }
    assert_eq!(items, vec!["urgent", "one", "two"]);
}

// =============================================================================
// Job
// =============================================================================

/// publish, claim, finish; a second finish is rejected.
pub async fn test_job_finish_once(registry: &Arc<Registry>, prefix: &str) {
    let jobs = registry
        .job(&format!("{}.jobs", prefix), None)
        .await
        .expect("open job queue");

    let id = jobs.publish("x", None, false).await.unwrap();
    let job = jobs.get(Duration::ZERO).await.unwrap().expect("job");
    assert_eq!((job.id.as_str(), job.item.as_str()), (id.as_str(), "x"));
    assert_eq!(jobs.claimed_ids().await.unwrap(), vec![id.clone()]);

    jobs.finish(&id, None).await.expect("first finish");
    assert!(matches!(
        jobs.finish(&id, None).await,
        Err(Error::JobNotClaimed { .. })
    ));
}

/// Stalled jobs are not dispatched until retried.
pub async fn test_job_stall_and_retry(registry: &Arc<Registry>, prefix: &str) {
    let jobs = registry
        .job(&format!("{}.stalls", prefix), None)
        .await
        .expect("open job queue");

    let id = jobs.publish("y", None, false).await.unwrap();
    jobs.get(Duration::ZERO).await.unwrap().expect("job");
    jobs.stall(&id).await.expect("stall");
    assert_eq!(jobs.get(SHORT).await.unwrap(), None);

    jobs.retry(&id).await.expect("retry");
    let job = jobs.get(Duration::ZERO).await.unwrap().expect("job");
    assert_eq!((job.id.as_str(), job.item.as_str()), (id.as_str(), "y"));
}

/// Cancelling N times counts N failures.
pub async fn test_job_cancel_count(registry: &Arc<Registry>, prefix: &str) {
    let jobs = registry
        .job(&format!("{}.cancels", prefix), None)
        .await
        .expect("open job queue");

    let id = jobs.put("z").await.unwrap();
    for _ in 0..3 {
        let job = jobs.get(SHORT).await.unwrap().expect("job");
        assert_eq!(job.id, id);
        jobs.cancel(&id).await.expect("cancel");
    }
    assert_eq!(jobs.get_num_of_failures(&id).await.unwrap(), 3);
}

/// An id is in exactly one of waiting, claimed or stalled at a time.
pub async fn test_job_single_location(registry: &Arc<Registry>, prefix: &str) {
    let jobs = registry
        .job(&format!("{}.locations", prefix), None)
        .await
        .expect("open job queue");

    async fn locations(jobs: &thoonk::Job, id: &str) -> usize {
        let waiting = jobs.get_ids().await.unwrap().iter().filter(|i| *i == id).count();
        let claimed = jobs.claimed_ids().await.unwrap().iter().filter(|i| *i == id).count();
        let stalled = jobs.stalled_ids().await.unwrap().iter().filter(|i| *i == id).count();
        waiting + claimed + stalled
    }

    let id = jobs.put("w").await.unwrap();
    assert_eq!(locations(&jobs, &id).await, 1);
    jobs.get(SHORT).await.unwrap().expect("job");
    assert_eq!(locations(&jobs, &id).await, 1);
    jobs.cancel(&id).await.unwrap();
    assert_eq!(locations(&jobs, &id).await, 1);
    jobs.get(SHORT).await.unwrap().expect("job");
    jobs.stall(&id).await.unwrap();
    assert_eq!(locations(&jobs, &id).await, 1);
    jobs.retry(&id).await.unwrap();
    assert_eq!(locations(&jobs, &id).await, 1);
    jobs.get(SHORT).await.unwrap().expect("job");
    jobs.finish(&id, None).await.unwrap();
    assert_eq!(locations(&jobs, &id).await, 0);
    assert!(!jobs.has_id(&id).await.unwrap());
}

/// A waiter registered at publish time receives the worker's result.
pub async fn test_job_result(registry: &Arc<Registry>, prefix: &str) {
    let jobs = registry
        .job(&format!("{}.results", prefix), None)
        .await
        .expect("open job queue");

    let waiter = jobs.publish_with_result("ping", None, false).await.unwrap();
    let worker = jobs.clone();
    tokio::spawn(async move {
        if let Ok(Some(job)) = worker.get(Duration::ZERO).await {
            let _ = worker.finish(&job.id, Some("pong")).await;
        }
    });

    let result = tokio::time::timeout(Duration::from_secs(2), waiter.wait())
        .await
        .expect("result within timeout")
        .expect("result");
    assert_eq!(result, "pong");
}

#[macro_export]
macro_rules! run_collection_tests {
    ($registry:expr, $prefix:expr) => {
        use $crate::collections::collection_tests::*;

        test_feed_publish_and_retract($registry, $prefix).await;
        println!("  test_feed_publish_and_retract: PASSED");

        test_feed_edit_vs_publish($registry, $prefix).await;
        println!("  test_feed_edit_vs_publish: PASSED");

        test_feed_max_length($registry, $prefix).await;
        println!("  test_feed_max_length: PASSED");

        test_sorted_feed_move_begin($registry, $prefix).await;
        println!("  test_sorted_feed_move_begin: PASSED");

        test_queue_roundtrip($registry, $prefix).await;
        println!("  test_queue_roundtrip: PASSED");

        test_job_finish_once($registry, $prefix).await;
        println!("  test_job_finish_once: PASSED");

        test_job_stall_and_retry($registry, $prefix).await;
        println!("  test_job_stall_and_retry: PASSED");

        test_job_cancel_count($registry, $prefix).await;
        println!("  test_job_cancel_count: PASSED");

        test_job_single_location($registry, $prefix).await;
        println!("  test_job_single_location: PASSED");

        test_job_result($registry, $prefix).await;
        println!("  test_job_result: PASSED");
    };
}
