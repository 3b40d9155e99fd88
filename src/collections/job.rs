//! Job queue: claim, finish, cancel, stall, retry.
//!
//! A job id is always in exactly one of the waiting list (`feed.ids`), the
//! claimed set or the stalled set while its payload exists. Every transition
//! out of the claimed or stalled set is guarded on membership and retried on
//! contention like any other transaction.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::feed::next_reply;
use super::{new_id, now_ms, read_counter, BlockingConnection, Collection, FeedCore};
use crate::bus::{Event, EventKind, Subscription};
use crate::error::{Error, Result};
use crate::interfaces::{Command, StoreExt};
use crate::keys;
use crate::transaction::{Guarded, Probe};

/// A claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobItem {
    pub id: String,
    pub item: String,
}

/// Resolves with the result a worker passes to [`Job::finish`].
pub struct ResultWaiter {
    id: String,
    subscription: Subscription,
}

impl ResultWaiter {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the job to finish with a result.
    ///
    /// Jobs finished without a result never resolve the waiter.
    pub async fn wait(mut self) -> Result<String> {
        loop {
            let event = self.subscription.recv().await;
            match event {
                Some(Event::Finish { result, .. }) => {
                    if let Err(e) = self.subscription.unsubscribe().await {
                        warn!(job = %self.id, error = %e, "Failed to release result subscription");
                    }
                    return Ok(result);
                }
                Some(_) => continue,
                None => return Err(Error::ListenerClosed),
            }
        }
    }
}

/// Job queue handle. Like [`Queue`](super::Queue), each handle claims on a
/// store connection of its own.
#[derive(Clone)]
pub struct Job {
    core: FeedCore,
    blocking: BlockingConnection,
}

impl Job {
    pub(crate) fn new(core: FeedCore) -> Self {
        Self {
            core,
            blocking: BlockingConnection::default(),
        }
    }

    fn claimed(&self) -> String {
        keys::claimed(self.core.name())
    }

    fn published(&self) -> String {
        keys::published(self.core.name())
    }

    fn stalled(&self) -> String {
        keys::stalled(self.core.name())
    }

    fn cancelled(&self) -> String {
        keys::cancelled(self.core.name())
    }

    fn job_error(
        &self,
        id: &str,
        make: fn(String, String) -> Error,
    ) -> impl Fn() -> Error + Send + Sync + 'static {
        let feed = self.core.name().to_string();
        let id = id.to_string();
        move || make(feed.clone(), id.clone())
    }

    /// Queue `item` under `id` (or a fresh id).
    ///
    /// A priority job is dequeued before every waiting one.
    #[tracing::instrument(name = "job.publish", skip_all, fields(feed = %self.core.name(), priority = priority))]
    pub async fn publish(&self, item: &str, id: Option<&str>, priority: bool) -> Result<String> {
        let registry = self.core.registry()?;
        let runner = registry.runner();
        let id = id.map_or_else(new_id, str::to_string);
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

        let _guard = runner.lock().acquire("job.publish").await;
        runner
            .exec_locked(vec![
                push,
                Command::Incr(keys::publishes(self.core.name())),
                Command::HSet {
                    key: self.core.items(),
                    field: id.clone(),
                    value: item.to_string(),
                },
                Command::ZAdd {
                    key: self.published(),
                    score: now_ms(),
                    member: id.clone(),
                    nx: false,
                },
                Command::Publish {
                    channel: self.core.channel(EventKind::Publish),
                    message: keys::join(&id, item),
                },
            ])
            .await?;
        debug!(id = %id, "Job published");
        Ok(id)
    }

    /// Same as a normal-priority [`Job::publish`] with a fresh id.
    pub async fn put(&self, item: &str) -> Result<String> {
        self.publish(item, None, false).await
    }

    /// Publish and get a waiter for the job's result.
    ///
    /// The waiter is subscribed before the job becomes visible, so a fast
    /// worker cannot finish it unseen.
    pub async fn publish_with_result(
        &self,
        item: &str,
        id: Option<&str>,
        priority: bool,
    ) -> Result<ResultWaiter> {
        let id = id.map_or_else(new_id, str::to_string);
        let waiter = self.watch_result(&id).await?;
        self.publish(item, Some(&id), priority).await?;
        Ok(waiter)
    }

    /// Waiter for the result of an already published job.
    pub async fn watch_result(&self, id: &str) -> Result<ResultWaiter> {
        let subscription = self.subscribe_item(id, &[EventKind::Finish]).await?;
        Ok(ResultWaiter {
            id: id.to_string(),
            subscription,
        })
    }

    /// Claim the next waiting job, waiting up to `timeout` (zero waits
    /// forever). Returns `None` on timeout.
    #[tracing::instrument(name = "job.get", skip_all, fields(feed = %self.core.name()))]
    pub async fn get(&self, timeout: Duration) -> Result<Option<JobItem>> {
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
                debug!("Timed out waiting for a job");
                return Ok(None);
            };

            let runner = registry.runner();
            let _guard = runner.lock().acquire("job.get").await;
            let replies = runner
                .exec_locked(vec![
                    Command::ZAdd {
                        key: self.claimed(),
                        score: now_ms(),
                        member: id.clone(),
                        nx: false,
                    },
                    Command::HGet {
                        key: self.core.items(),
                        field: id.clone(),
                    },
                ])
                .await?;
            let mut replies = replies.into_iter().skip(1);
            match next_reply(&mut replies, "HGET")?.into_data("HGET")? {
                Some(item) => {
                    debug!(id = %id, "Job claimed");
                    return Ok(Some(JobItem { id, item }));
                }
                None => {
                    // Retracted between the pop and the claim.
                    runner
                        .exec_locked(vec![Command::ZRem {
                            key: self.claimed(),
                            member: id.clone(),
                        }])
                        .await?;
                    debug!(id = %id, "Skipping job without payload");
                }
            }
        }
    }

    /// Complete a claimed job, announcing `result` to anyone waiting on it.
    #[tracing::instrument(name = "job.finish", skip_all, fields(feed = %self.core.name()))]
    pub async fn finish(&self, id: &str, result: Option<&str>) -> Result<()> {
        let registry = self.core.registry()?;
        let mut commands = vec![
            Command::ZRem {
                key: self.claimed(),
                member: id.to_string(),
            },
            Command::HDel {
                key: self.cancelled(),
                field: id.to_string(),
            },
            Command::ZRem {
                key: self.published(),
                member: id.to_string(),
            },
            Command::Incr(keys::finishes(self.core.name())),
        ];
        if let Some(result) = result {
            commands.push(Command::Publish {
                channel: self.core.channel(EventKind::Finish),
                message: keys::join(id, result),
            });
        }
        commands.push(Command::HDel {
            key: self.core.items(),
            field: id.to_string(),
        });

        let tx = Guarded::new(
            "job.finish",
            Probe::SortedMember {
                key: self.claimed(),
                member: id.to_string(),
            },
            commands,
            self.job_error(id, |feed, id| Error::JobNotClaimed { feed, id }),
        );
        registry.runner().run(&tx).await?;
        debug!(id = %id, "Job finished");
        Ok(())
    }

    /// Give a claimed job back; it is dequeued next.
    #[tracing::instrument(name = "job.cancel", skip_all, fields(feed = %self.core.name()))]
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let registry = self.core.registry()?;
        let tx = Guarded::new(
            "job.cancel",
            Probe::SortedMember {
                key: self.claimed(),
                member: id.to_string(),
            },
            vec![
                Command::HIncrBy {
                    key: self.cancelled(),
                    field: id.to_string(),
                    delta: 1,
                },
                Command::RPush {
                    key: self.core.ids(),
                    value: id.to_string(),
                },
                Command::ZRem {
                    key: self.claimed(),
                    member: id.to_string(),
                },
            ],
            self.job_error(id, |feed, id| Error::IdUnclaimed { feed, id }),
        );
        registry.runner().run(&tx).await?;
        debug!(id = %id, "Job cancelled");
        Ok(())
    }

    /// Park a claimed job until [`Job::retry`].
    #[tracing::instrument(name = "job.stall", skip_all, fields(feed = %self.core.name()))]
    pub async fn stall(&self, id: &str) -> Result<()> {
        let registry = self.core.registry()?;
        let tx = Guarded::new(
            "job.stall",
            Probe::SortedMember {
                key: self.claimed(),
                member: id.to_string(),
            },
            vec![
                Command::ZRem {
                    key: self.claimed(),
                    member: id.to_string(),
                },
                Command::HDel {
                    key: self.cancelled(),
                    field: id.to_string(),
                },
                Command::SAdd {
                    key: self.stalled(),
                    member: id.to_string(),
                },
                Command::ZRem {
                    key: self.published(),
                    member: id.to_string(),
                },
            ],
            self.job_error(id, |feed, id| Error::NotClaimed { feed, id }),
        );
        registry.runner().run(&tx).await?;
        info!(feed = %self.core.name(), id = %id, "Job stalled");
        Ok(())
    }

    /// Requeue a stalled job at the back of the queue.
    #[tracing::instrument(name = "job.retry", skip_all, fields(feed = %self.core.name()))]
    pub async fn retry(&self, id: &str) -> Result<()> {
        let registry = self.core.registry()?;
        let tx = Guarded::new(
            "job.retry",
            Probe::SetMember {
                key: self.stalled(),
                member: id.to_string(),
            },
            vec![
                Command::SRem {
                    key: self.stalled(),
                    member: id.to_string(),
                },
                Command::LPush {
                    key: self.core.ids(),
                    value: id.to_string(),
                },
                Command::ZAdd {
                    key: self.published(),
                    score: now_ms(),
                    member: id.to_string(),
                    nx: false,
                },
            ],
            self.job_error(id, |feed, id| Error::IdNotStalled { feed, id }),
        );
        registry.runner().run(&tx).await?;
        debug!(id = %id, "Job retried");
        Ok(())
    }

    /// Delete a job in whatever state it is in.
    #[tracing::instrument(name = "job.retract", skip_all, fields(feed = %self.core.name()))]
    pub async fn retract(&self, id: &str) -> Result<()> {
        let registry = self.core.registry()?;
        let tx = Guarded::new(
            "job.retract",
            Probe::HashField {
                key: self.core.items(),
                field: id.to_string(),
            },
            vec![
                Command::HDel {
                    key: self.core.items(),
                    field: id.to_string(),
                },
                Command::HDel {
                    key: self.cancelled(),
                    field: id.to_string(),
                },
                Command::ZRem {
                    key: self.published(),
                    member: id.to_string(),
                },
                Command::SRem {
                    key: self.stalled(),
                    member: id.to_string(),
                },
                Command::ZRem {
                    key: self.claimed(),
                    member: id.to_string(),
                },
                Command::LRem {
                    key: self.core.ids(),
                    count: 1,
                    value: id.to_string(),
                },
                Command::Publish {
                    channel: self.core.channel(EventKind::Retract),
                    message: id.to_string(),
                },
            ],
            self.job_error(id, |feed, id| Error::IdNotFound { feed, id }),
        );
        registry.runner().run(&tx).await?;
        Ok(())
    }

    /// Times `id` has been cancelled since it was last finished or stalled.
    pub async fn get_num_of_failures(&self, id: &str) -> Result<u64> {
        let registry = self.core.registry()?;
        read_counter(registry.runner().store().hget(&self.cancelled(), id).await?)
    }

    /// Claimed ids, oldest claim first.
    pub async fn claimed_ids(&self) -> Result<Vec<String>> {
        let registry = self.core.registry()?;
        registry.runner().store().zrange(&self.claimed(), 0, -1).await
    }

    pub async fn stalled_ids(&self) -> Result<Vec<String>> {
        let registry = self.core.registry()?;
        let mut ids = registry.runner().store().smembers(&self.stalled()).await?;
        ids.sort();
        Ok(ids)
    }

    /// Jobs waiting to be claimed.
    pub async fn len(&self) -> Result<u64> {
        let registry = self.core.registry()?;
        registry.runner().store().llen(&self.core.ids()).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn finish_count(&self) -> Result<u64> {
        let registry = self.core.registry()?;
        read_counter(
            registry
                .runner()
                .store()
                .get(&keys::finishes(self.core.name()))
                .await?,
        )
    }
}

#[async_trait]
impl Collection for Job {
    fn core(&self) -> &FeedCore {
        &self.core
    }

    /// Waiting ids, next to be claimed last.
    async fn get_ids(&self) -> Result<Vec<String>> {
        let registry = self.core.registry()?;
        registry.runner().store().lrange(&self.core.ids(), 0, -1).await
    }
}
