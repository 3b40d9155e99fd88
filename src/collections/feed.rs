//! Time-ordered feed with optional length bound.

use async_trait::async_trait;
use tracing::debug;

use super::{new_id, now_ms, Collection, FeedCore};
use crate::bus::{Event, EventKind};
use crate::error::{Error, Result};
use crate::interfaces::{Command, Reply, Store, StoreExt};
use crate::keys;
use crate::transaction::{Guarded, Probe, Transaction};

/// Items ordered by publish time, kept in a sorted set scored in milliseconds.
///
/// Republishing an existing id replaces its payload without moving it.
#[derive(Clone)]
pub struct Feed {
    core: FeedCore,
}

impl Feed {
    pub(crate) fn new(core: FeedCore) -> Self {
        Self { core }
    }

    /// Publish `item`, under `id` if given, evicting the oldest items when the
    /// feed has a `max_length`.
    ///
    /// Emits `retract` for each evicted item, then `publish` for a new id or
    /// `edit` for an existing one. Returns the item id.
    #[tracing::instrument(name = "feed.publish", skip_all, fields(feed = %self.core.name()))]
    pub async fn publish(&self, item: &str, id: Option<&str>) -> Result<String> {
        let registry = self.core.registry()?;
        let max_length = registry.config(self.core.name()).await?.max_length;
        let tx = Publish {
            core: &self.core,
            id: id.map_or_else(new_id, str::to_string),
            item: item.to_string(),
            max_length,
        };

        let runner = registry.runner();
        let _guard = runner.lock().acquire(tx.name()).await;
        let added = runner.run_locked(&tx).await?;

        let event = if added {
            Event::Publish {
                feed: self.core.name().to_string(),
                id: tx.id.clone(),
                item: tx.item.clone(),
            }
        } else {
            Event::Edit {
                feed: self.core.name().to_string(),
                id: tx.id.clone(),
                item: tx.item.clone(),
            }
        };
        let (channel, body) = event.encode();
        runner.store().publish(&channel, &body).await?;
        debug!(id = %tx.id, added, "Published");
        Ok(tx.id)
    }

    /// Replace the payload of `id`, or publish it if it is new.
    pub async fn edit(&self, id: &str, item: &str) -> Result<String> {
        self.publish(item, Some(id)).await
    }

    #[tracing::instrument(name = "feed.retract", skip_all, fields(feed = %self.core.name()))]
    pub async fn retract(&self, id: &str) -> Result<()> {
        let registry = self.core.registry()?;
        let core = self.core.clone();
        let missing = id.to_string();
        let tx = Guarded::new(
            "feed.retract",
            Probe::SortedMember {
                key: self.core.ids(),
                member: id.to_string(),
            },
            vec![
                Command::ZRem {
                    key: self.core.ids(),
                    member: id.to_string(),
                },
                Command::HDel {
                    key: self.core.items(),
                    field: id.to_string(),
                },
                Command::Publish {
                    channel: self.core.channel(EventKind::Retract),
                    message: id.to_string(),
                },
            ],
            move || core.does_not_exist(&missing),
        );
        registry.runner().run(&tx).await?;
        Ok(())
    }

    /// Every `(id, item)` pair, oldest first, read as one snapshot.
    pub async fn get_all(&self) -> Result<Vec<(String, String)>> {
        self.core
            .snapshot(
                "feed.get_all",
                Command::ZRange {
                    key: self.core.ids(),
                    start: 0,
                    stop: -1,
                    withscores: false,
                },
            )
            .await
    }
}

#[async_trait]
impl Collection for Feed {
    fn core(&self) -> &FeedCore {
        &self.core
    }

    async fn get_ids(&self) -> Result<Vec<String>> {
        let registry = self.core.registry()?;
        registry.runner().store().zrange(&self.core.ids(), 0, -1).await
    }
}

pub(crate) fn next_reply(
    replies: &mut impl Iterator<Item = Reply>,
    command: &'static str,
) -> Result<Reply> {
    replies.next().ok_or_else(|| Error::UnexpectedReply {
        command,
        reply: "missing from EXEC result".to_string(),
    })
}

struct Publish<'a> {
    core: &'a FeedCore,
    id: String,
    item: String,
    max_length: Option<u64>,
}

struct PublishState {
    score: f64,
    evict: Vec<String>,
}

#[async_trait]
impl Transaction for Publish<'_> {
    type State = PublishState;
    /// Whether the id was new.
    type Output = bool;

    fn name(&self) -> &'static str {
        "feed.publish"
    }

    fn watched(&self) -> Vec<String> {
        vec![self.core.ids()]
    }

    async fn read(&self, store: &dyn Store) -> Result<PublishState> {
        let ids = self.core.ids();
        let last = store.zrange_withscores(&ids, -1, -1).await?;
        // Strictly increasing scores keep same-millisecond publishes in order.
        let score = match last.first() {
            Some((_, last)) => now_ms().max(last + 1.0),
            None => now_ms(),
        };

        let mut evict = Vec::new();
        if let Some(max_length) = self.max_length {
            let exists = store.zscore(&ids, &self.id).await?.is_some();
            // Length after this publish, before trimming.
            let len = store.zcard(&ids).await? + u64::from(!exists);
            if len > max_length {
                let excess = (len - max_length) as usize;
                // One extra in case the published id is among the oldest.
                evict = store
                    .zrange(&ids, 0, excess as isize)
                    .await?
                    .into_iter()
                    .filter(|id| *id != self.id)
                    .take(excess)
                    .collect();
            }
        }
        Ok(PublishState { score, evict })
    }

    fn write(&self, state: &PublishState) -> Vec<Command> {
        let mut commands = Vec::with_capacity(state.evict.len() * 3 + 3);
        for id in &state.evict {
            commands.push(Command::ZRem {
                key: self.core.ids(),
                member: id.clone(),
            });
            commands.push(Command::HDel {
                key: self.core.items(),
                field: id.clone(),
            });
            commands.push(Command::Publish {
                channel: self.core.channel(EventKind::Retract),
                message: id.clone(),
            });
        }
        commands.push(Command::ZAdd {
            key: self.core.ids(),
            score: state.score,
            member: self.id.clone(),
            nx: true,
        });
        commands.push(Command::Incr(keys::publishes(self.core.name())));
        commands.push(Command::HSet {
            key: self.core.items(),
            field: self.id.clone(),
            value: self.item.clone(),
        });
        commands
    }

    fn commit(&self, state: PublishState, replies: Vec<Reply>) -> Result<bool> {
        if !state.evict.is_empty() {
            debug!(evicted = state.evict.len(), "Trimmed feed to max_length");
        }
        let mut replies = replies.into_iter().skip(state.evict.len() * 3);
        next_reply(&mut replies, "ZADD")?.into_bool("ZADD")
    }
}
