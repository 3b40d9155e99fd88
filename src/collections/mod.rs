//! Collection handles.
//!
//! Each handle is a name plus a weak reference to the [`Registry`] it was
//! opened from. All state lives in the store; handles are cheap to clone and
//! any number of them (in any number of processes) may address one feed.

mod feed;
mod job;
mod queue;
mod sorted_feed;


pub use feed::Feed;
pub use job::{Job, JobItem, ResultWaiter};
pub use queue::Queue;
pub use sorted_feed::{Placement, SortedFeed};

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::bus::{EventKind, Subscription, Target};
use crate::error::{Error, Result};
use crate::interfaces::{Command, Store, StoreExt};
use crate::keys;
use crate::registry::Registry;
use feed::next_reply;

/// Name and registry shared by every collection type.
#[derive(Clone)]
pub struct FeedCore {
    name: String,
    registry: Weak<Registry>,
}

impl FeedCore {
    pub(crate) fn new(name: &str, registry: Weak<Registry>) -> Self {
        Self {
            name: name.to_string(),
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> Result<Arc<Registry>> {
        self.registry.upgrade().ok_or(Error::RegistryClosed)
    }

    pub(crate) fn ids(&self) -> String {
        keys::ids(&self.name)
    }

    pub(crate) fn items(&self) -> String {
        keys::items(&self.name)
    }

    pub(crate) fn channel(&self, kind: EventKind) -> String {
        keys::channel(kind, &self.name)
    }

    pub(crate) fn does_not_exist(&self, id: &str) -> Error {
        Error::DoesNotExist {
            feed: self.name.clone(),
            id: id.to_string(),
        }
    }

    /// `(id, item)` pairs in the order `ordered` returns the ids, read in one
    /// EXEC together with the items hash.
    pub(crate) async fn snapshot(
        &self,
        operation: &'static str,
        ordered: Command,
    ) -> Result<Vec<(String, String)>> {
        let registry = self.registry()?;
        let runner = registry.runner();
        let command = ordered.name();
        let replies = {
            let _guard = runner.lock().acquire(operation).await;
            runner
                .exec_locked(vec![ordered, Command::HGetAll(self.items())])
                .await?
        };

        let mut replies = replies.into_iter();
        let ids = next_reply(&mut replies, command)?.into_array(command)?;
        let mut items = next_reply(&mut replies, "HGETALL")?.into_map("HGETALL")?;
        Ok(ids
            .into_iter()
            .filter_map(|id| items.remove(&id).map(|item| (id, item)))
            .collect())
    }
}

/// Store connection a handle pops from, opened on first use.
///
/// A blocked pop holds its connection until it returns, so the connection
/// is never shared: cloning yields an unopened one.
#[derive(Default)]
pub(crate) struct BlockingConnection {
    store: OnceCell<Arc<dyn Store>>,
}

impl BlockingConnection {
    pub(crate) async fn connect(&self, registry: &Registry) -> Result<Arc<dyn Store>> {
        let store = self
            .store
            .get_or_try_init(|| registry.open_blocking())
            .await?;
        Ok(store.clone())
    }
}

impl Clone for BlockingConnection {
    fn clone(&self) -> Self {
        Self::default()
    }
}

/// Operations every collection type supports.
#[async_trait]
pub trait Collection: Send + Sync {
    fn core(&self) -> &FeedCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    /// Ids in the collection's own order.
    async fn get_ids(&self) -> Result<Vec<String>>;

    async fn get_item(&self, id: &str) -> Result<Option<String>> {
        let core = self.core();
        core.registry()?.runner().store().hget(&core.items(), id).await
    }

    async fn has_id(&self, id: &str) -> Result<bool> {
        let core = self.core();
        core.registry()?.runner().store().hexists(&core.items(), id).await
    }

    /// Items ever published to the collection.
    async fn publish_count(&self) -> Result<u64> {
        let core = self.core();
        let registry = core.registry()?;
        read_counter(registry.runner().store().get(&keys::publishes(core.name())).await?)
    }

    /// Events of `kinds` on this collection.
    ///
    /// Resolves once the store has acknowledged the subscription.
    async fn subscribe(&self, kinds: &[EventKind]) -> Result<Subscription> {
        let core = self.core();
        core.registry()?
            .fanout()
            .subscribe(Target::feed(core.name(), kinds), None)
            .await
    }

    /// Events of `kinds` concerning one item only.
    async fn subscribe_item(&self, id: &str, kinds: &[EventKind]) -> Result<Subscription> {
        let core = self.core();
        core.registry()?
            .fanout()
            .subscribe(Target::feed(core.name(), kinds), Some(id.to_string()))
            .await
    }

    /// Remove the collection and everything in it.
    async fn delete(&self) -> Result<()> {
        let core = self.core();
        core.registry()?.delete_feed(core.name()).await
    }
}

pub(crate) fn read_counter(value: Option<String>) -> Result<u64> {
    match value {
        None => Ok(0),
        Some(raw) => raw.parse().map_err(|_| Error::UnexpectedReply {
            command: "GET",
            reply: raw,
        }),
    }
}

/// Milliseconds since the epoch, as a sorted set score.
pub(crate) fn now_ms() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
