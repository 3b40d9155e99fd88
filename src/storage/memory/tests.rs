use super::*;
use crate::interfaces::StoreExt;

fn rpush(key: &str, value: &str) -> Command {
    Command::RPush {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn hset(key: &str, field: &str, value: &str) -> Command {
    Command::HSet {
        key: key.to_string(),
        field: field.to_string(),
        value: value.to_string(),
    }
}

#[tokio::test]
async fn test_exec_without_watch_commits() {
    let store = MemoryStore::new();
    let conn = store.connection();

    let replies = conn
        .exec(vec![hset("h", "a", "1"), hset("h", "a", "2")])
        .await
        .unwrap()
        .unwrap();

    assert_eq!(replies, vec![Reply::Int(1), Reply::Int(0)]);
    assert_eq!(conn.hget("h", "a").await.unwrap(), Some("2".to_string()));
}

#[tokio::test]
async fn test_exec_aborts_when_other_connection_writes_watched_key() {
    let store = MemoryStore::new();
    let first = store.connection();
    let second = store.connection();

    first.watch(&["h".to_string()]).await.unwrap();
    second.query(hset("h", "x", "1")).await.unwrap();

    let result = first.exec(vec![hset("h", "y", "1")]).await.unwrap();
    assert!(result.is_none());
    assert_eq!(store.aborted_transactions(), 1);
    assert_eq!(first.hget("h", "y").await.unwrap(), None);
}

#[tokio::test]
async fn test_watch_cleared_after_exec() {
    let store = MemoryStore::new();
    let first = store.connection();
    let second = store.connection();

    first.watch(&["h".to_string()]).await.unwrap();
    first.exec(vec![hset("h", "a", "1")]).await.unwrap().unwrap();

    second.query(hset("h", "b", "1")).await.unwrap();
    let result = first.exec(vec![hset("h", "c", "1")]).await.unwrap();
    assert!(result.is_some());
}

#[tokio::test]
async fn test_unwatch_forgets_keys() {
    let store = MemoryStore::new();
    let first = store.connection();
    let second = store.connection();

    first.watch(&["h".to_string()]).await.unwrap();
    second.query(hset("h", "x", "1")).await.unwrap();
    first.unwatch().await.unwrap();

    assert!(first.exec(vec![hset("h", "y", "1")]).await.unwrap().is_some());
}

#[tokio::test]
async fn test_no_op_write_does_not_abort_watchers() {
    let store = MemoryStore::new();
    let first = store.connection();
    let second = store.connection();

    first.watch(&["s".to_string()]).await.unwrap();
    second
        .query(Command::SRem {
            key: "s".to_string(),
            member: "missing".to_string(),
        })
        .await
        .unwrap();

    assert!(first.exec(vec![]).await.unwrap().is_some());
}

#[tokio::test]
async fn test_interfere_aborts_exactly_once() {
    let store = MemoryStore::new();
    let conn = store.connection();
    store.interfere("h", vec![hset("h", "other", "x")]);

    conn.watch(&["h".to_string()]).await.unwrap();
    assert!(conn.exec(vec![hset("h", "mine", "1")]).await.unwrap().is_none());

    conn.watch(&["h".to_string()]).await.unwrap();
    assert!(conn.exec(vec![hset("h", "mine", "1")]).await.unwrap().is_some());

    let all = conn.hgetall("h").await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(store.aborted_transactions(), 1);
}

#[tokio::test]
async fn test_zadd_nx_keeps_score_and_reports_added() {
    let store = MemoryStore::new();
    let conn = store.connection();
    let zadd = |score: f64, nx: bool| Command::ZAdd {
        key: "z".to_string(),
        score,
        member: "a".to_string(),
        nx,
    };

    assert_eq!(conn.query(zadd(5.0, true)).await.unwrap(), Reply::Int(1));
    assert_eq!(conn.query(zadd(9.0, true)).await.unwrap(), Reply::Int(0));
    assert_eq!(conn.zscore("z", "a").await.unwrap(), Some(5.0));

    assert_eq!(conn.query(zadd(9.0, false)).await.unwrap(), Reply::Int(0));
    assert_eq!(conn.zscore("z", "a").await.unwrap(), Some(9.0));
}

#[tokio::test]
async fn test_zrange_orders_by_score() {
    let store = MemoryStore::new();
    let conn = store.connection();
    for (member, score) in [("c", 3.0), ("a", 1.0), ("b", 2.0)] {
        conn.query(Command::ZAdd {
            key: "z".to_string(),
            score,
            member: member.to_string(),
            nx: false,
        })
        .await
        .unwrap();
    }

    assert_eq!(conn.zrange("z", 0, -1).await.unwrap(), vec!["a", "b", "c"]);
    assert_eq!(conn.zrange("z", 0, 1).await.unwrap(), vec!["a", "b"]);
    assert_eq!(conn.zrange("z", -1, -1).await.unwrap(), vec!["c"]);
    assert!(conn.zrange("z", 5, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_insert_and_remove() {
    let store = MemoryStore::new();
    let conn = store.connection();
    conn.query(rpush("l", "1")).await.unwrap();
    conn.query(rpush("l", "3")).await.unwrap();

    let reply = conn
        .query(Command::LInsert {
            key: "l".to_string(),
            before: true,
            pivot: "3".to_string(),
            value: "2".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(reply, Reply::Int(3));
    assert_eq!(conn.lrange("l", 0, -1).await.unwrap(), vec!["1", "2", "3"]);

    let missing = conn
        .query(Command::LInsert {
            key: "l".to_string(),
            before: false,
            pivot: "9".to_string(),
            value: "x".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(missing, Reply::Int(-1));

    conn.query(Command::LRem {
        key: "l".to_string(),
        count: 1,
        value: "2".to_string(),
    })
    .await
    .unwrap();
    assert_eq!(conn.lrange("l", 0, -1).await.unwrap(), vec!["1", "3"]);
}

#[tokio::test]
async fn test_empty_containers_disappear() {
    let store = MemoryStore::new();
    let conn = store.connection();
    conn.query(hset("h", "a", "1")).await.unwrap();
    conn.query(Command::HDel {
        key: "h".to_string(),
        field: "a".to_string(),
    })
    .await
    .unwrap();

    let deleted = conn.query(Command::Del(vec!["h".to_string()])).await.unwrap();
    assert_eq!(deleted, Reply::Int(0));
}

#[tokio::test]
async fn test_wrong_type_is_store_error() {
    let store = MemoryStore::new();
    let conn = store.connection();
    conn.query(Command::Set {
        key: "k".to_string(),
        value: "v".to_string(),
    })
    .await
    .unwrap();

    let err = conn.query(hset("k", "a", "1")).await.unwrap_err();
    assert!(err.is_connectivity());
}

#[tokio::test]
async fn test_brpop_times_out_on_empty_list() {
    let store = MemoryStore::new();
    let conn = store.connection();

    let popped = conn.brpop("l", Duration::from_millis(20)).await.unwrap();
    assert_eq!(popped, None);
}

#[tokio::test]
async fn test_brpop_wakes_on_push_from_other_connection() {
    let store = MemoryStore::new();
    let blocking = store.connection();
    let writer = store.connection();

    let waiter = tokio::spawn(async move { blocking.brpop("l", Duration::ZERO).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    writer.query(Command::LPush {
        key: "l".to_string(),
        value: "job".to_string(),
    })
    .await
    .unwrap();

    let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(popped, Some("job".to_string()));
}

#[tokio::test]
async fn test_pending_brpop_holds_its_connection() {
    let store = MemoryStore::new();
    let blocking = Arc::new(store.connection());
    let other = store.connection();

    let popping = blocking.clone();
    let waiter = tokio::spawn(async move { popping.brpop("l", Duration::ZERO).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let queued = tokio::time::timeout(Duration::from_millis(50), blocking.llen("l")).await;
    assert!(queued.is_err(), "command ran while a pop was pending");
    assert_eq!(other.llen("l").await.unwrap(), 0);

    other.query(rpush("l", "job")).await.unwrap();
    let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(popped, Some("job".to_string()));
    assert_eq!(blocking.llen("l").await.unwrap(), 0);
}

#[tokio::test]
async fn test_brpop_pops_right_end() {
    let store = MemoryStore::new();
    let conn = store.connection();
    conn.query(rpush("l", "first")).await.unwrap();
    conn.query(rpush("l", "second")).await.unwrap();

    let popped = conn.brpop("l", Duration::from_millis(10)).await.unwrap();
    assert_eq!(popped, Some("second".to_string()));
}

#[tokio::test]
async fn test_publish_reaches_channel_and_pattern_subscribers() {
    let store = MemoryStore::new();
    let conn = store.connection();
    let (pubsub, mut rx) = store.listen().await.unwrap();

    pubsub.subscribe("feed.publish:news").await.unwrap();
    pubsub.psubscribe("feed.publish:*").await.unwrap();

    let receivers = conn.publish("feed.publish:news", "1\x00a").await.unwrap();
    assert_eq!(receivers, 2);

    let exact = rx.recv().await.unwrap();
    assert_eq!(exact.pattern, None);
    assert_eq!(exact.channel, "feed.publish:news");
    assert_eq!(exact.payload, "1\x00a");

    let matched = rx.recv().await.unwrap();
    assert_eq!(matched.pattern.as_deref(), Some("feed.publish:*"));
    assert_eq!(matched.channel, "feed.publish:news");
}

#[tokio::test]
async fn test_unsubscribed_channel_is_silent() {
    let store = MemoryStore::new();
    let conn = store.connection();
    let (pubsub, mut rx) = store.listen().await.unwrap();

    pubsub.subscribe("c").await.unwrap();
    pubsub.unsubscribe("c").await.unwrap();

    assert_eq!(conn.publish("c", "x").await.unwrap(), 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_dropping_listener_closes_receiver() {
    let store = MemoryStore::new();
    let (pubsub, mut rx) = store.listen().await.unwrap();
    drop(pubsub);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_offline_store_fails_every_operation() {
    let store = MemoryStore::new();
    let conn = store.connection();
    store.set_offline(true);

    assert!(conn.get("k").await.unwrap_err().is_connectivity());
    assert!(store.connect().await.is_err());

    store.set_offline(false);
    assert_eq!(conn.get("k").await.unwrap(), None);
}
