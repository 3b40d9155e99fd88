//! FIFO queue with destructive, blocking dequeue.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::feed::next_reply;
use super::{new_id, BlockingConnection, Collection, FeedCore};
use crate::error::Result;
use crate::interfaces::{Command, StoreExt};
use crate::keys;
use crate::transaction::{Guarded, Probe};

/// Items enter at the list head and are popped from the tail.
///
/// A priority publish goes straight to the tail, so it is dequeued next.
/// Each handle pops on a store connection of its own; a clone opens another.
#[derive(Clone)]
pub struct Queue {
    core: FeedCore,
    blocking: BlockingConnection,
}

impl Queue {
    pub(crate) fn new(core: FeedCore) -> Self {
        Self {
            core,
            blocking: BlockingConnection::default(),
        }
    }

    #[tracing::instrument(name = "queue.publish", skip_all, fields(feed = %self.core.name(), priority = priority))]
    pub async fn publish(&self, item: &str, priority: bool) -> Result<String> {
        let registry = self.core.registry()?;
        let runner = registry.runner();
        let id = new_id();
        let push = if priority {
            Command::RPush {
                key: self.core.ids(),
                value: id.clone(),
            }
        } else {
            Command::LPush {
                key: self.core.ids(),
                value: id.clone(),
            }
        };

        let _guard = runner.lock().acquire("queue.publish").await;
        runner
            .exec_locked(vec![
                push,
                Command::HSet {
                    key: self.core.items(),
                    field: id.clone(),
                    value: item.to_string(),
                },
                Command::Incr(keys::publishes(self.core.name())),
            ])
            .await?;
        Ok(id)
    }

    /// Same as a normal-priority [`Queue::publish`].
    pub async fn put(&self, item: &str) -> Result<String> {
        self.publish(item, false).await
    }

    /// Pop the next item, waiting up to `timeout` (zero waits forever).
    ///
    /// Returns `(id, item)`, or `None` on timeout. The item is gone from the
    /// store once returned. Ids whose payload was retracted after the pop are
    /// skipped while time remains.
    #[tracing::instrument(name = "queue.get", skip_all, fields(feed = %self.core.name()))]
    pub async fn get(&self, timeout: Duration) -> Result<Option<(String, String)>> {
        let registry = self.core.registry()?;
        let blocking = self.blocking.connect(&registry).await?;
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        loop {
            let wait = match deadline {
                None => Duration::ZERO,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(None);
                    }
                    left
                }
            };
            let Some(id) = blocking.brpop(&self.core.ids(), wait).await? else {
                debug!("Timed out waiting for an item");
                return Ok(None);
            };

            let runner = registry.runner();
            let replies = {
                let _guard = runner.lock().acquire("queue.get").await;
                runner
                    .exec_locked(vec![
                        Command::HGet {
                            key: self.core.items(),
                            field: id.clone(),
                        },
                        Command::HDel {
                            key: self.core.items(),
                            field: id.clone(),
                        },
                    ])
                    .await?
            };
            match next_reply(&mut replies.into_iter(), "HGET")?.into_data("HGET")? {
                Some(item) => return Ok(Some((id, item))),
                None => debug!(id = %id, "Skipping item without payload"),
            }
        }
    }

    /// Remove a queued item before anyone dequeues it.
    #[tracing::instrument(name = "queue.retract", skip_all, fields(feed = %self.core.name()))]
    pub async fn retract(&self, id: &str) -> Result<()> {
        let registry = self.core.registry()?;
        let core = self.core.clone();
        let missing = id.to_string();
        let tx = Guarded::new(
            "queue.retract",
            Probe::HashField {
                key: self.core.items(),
                field: id.to_string(),
            },
            vec![
                Command::LRem {
                    key: self.core.ids(),
                    count: 1,
                    value: id.to_string(),
                },
                Command::HDel {
                    key: self.core.items(),
                    field: id.to_string(),
                },
            ],
            move || core.does_not_exist(&missing),
        );
        registry.runner().run(&tx).await?;
        Ok(())
    }

    /// Items waiting to be dequeued.
    pub async fn len(&self) -> Result<u64> {
        let registry = self.core.registry()?;
        registry.runner().store().llen(&self.core.ids()).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

#[async_trait]
impl Collection for Queue {
    fn core(&self) -> &FeedCore {
        &self.core
    }

    /// Waiting ids, next to be dequeued last.
    async fn get_ids(&self) -> Result<Vec<String>> {
        let registry = self.core.registry()?;
        registry.runner().store().lrange(&self.core.ids(), 0, -1).await
    }
}
