//! Request/response store interface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::command::{Command, Reply};
use super::pubsub::{ChannelMessage, PubSub};
use crate::error::Result;

/// One request/response connection to the store.
///
/// WATCH state belongs to the connection: keys watched through one `Store`
/// only guard the next `exec` on that same `Store`.
///
/// Implementations:
/// - `RedisStore`: Redis via `ConnectionManager`
/// - `MemoryConnection`: in-process store
#[async_trait]
pub trait Store: Send + Sync {
    /// Watch keys for the next `exec`.
    async fn watch(&self, keys: &[String]) -> Result<()>;

    /// Forget every watched key without executing anything.
    async fn unwatch(&self) -> Result<()>;

    /// Run one command outside a transaction.
    async fn query(&self, command: Command) -> Result<Reply>;

    /// Run commands atomically.
    ///
    /// Returns `None` when a watched key changed since `watch`, in which case
    /// nothing was applied. Watches are cleared either way.
    async fn exec(&self, commands: Vec<Command>) -> Result<Option<Vec<Reply>>>;

    /// Pop from the right end of a list, waiting up to `timeout`.
    ///
    /// `Duration::ZERO` waits indefinitely. Returns `None` on timeout.
    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>>;
}

/// Typed helpers over [`Store::query`].
#[async_trait]
pub trait StoreExt: Store {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query(Command::Get(key.to_string()))
            .await?
            .into_data("GET")
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.query(Command::Incr(key.to_string()))
            .await?
            .into_int("INCR")
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        self.query(Command::SIsMember {
            key: key.to_string(),
            member: member.to_string(),
        })
        .await?
        .into_bool("SISMEMBER")
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.query(Command::SMembers(key.to_string()))
            .await?
            .into_array("SMEMBERS")
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let score = self
            .query(Command::ZScore {
                key: key.to_string(),
                member: member.to_string(),
            })
            .await?
            .into_data("ZSCORE")?;
        Ok(score.and_then(|s| s.parse().ok()))
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let n = self
            .query(Command::ZCard(key.to_string()))
            .await?
            .into_int("ZCARD")?;
        Ok(n.max(0) as u64)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.query(Command::ZRange {
            key: key.to_string(),
            start,
            stop,
            withscores: false,
        })
        .await?
        .into_array("ZRANGE")
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        self.query(Command::ZRange {
            key: key.to_string(),
            start,
            stop,
            withscores: true,
        })
        .await?
        .into_scored("ZRANGE")
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.query(Command::LRange {
            key: key.to_string(),
            start,
            stop,
        })
        .await?
        .into_array("LRANGE")
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let n = self
            .query(Command::LLen(key.to_string()))
            .await?
            .into_int("LLEN")?;
        Ok(n.max(0) as u64)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.query(Command::HGet {
            key: key.to_string(),
            field: field.to_string(),
        })
        .await?
        .into_data("HGET")
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        self.query(Command::HExists {
            key: key.to_string(),
            field: field.to_string(),
        })
        .await?
        .into_bool("HEXISTS")
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.query(Command::HGetAll(key.to_string()))
            .await?
            .into_map("HGETALL")
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<i64> {
        self.query(Command::Publish {
            channel: channel.to_string(),
            message: message.to_string(),
        })
        .await?
        .into_int("PUBLISH")
    }
}

impl<T: Store + ?Sized> StoreExt for T {}

/// Opens connections to one store.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open an independent request/response connection with its own WATCH state.
    async fn connect(&self) -> Result<Arc<dyn Store>>;

    /// Open a pub/sub connection.
    ///
    /// Messages for every subscribed channel and pattern arrive on the
    /// returned receiver. The receiver closes when the connection is lost.
    async fn listen(&self) -> Result<(Arc<dyn PubSub>, mpsc::UnboundedReceiver<ChannelMessage>)>;
}
