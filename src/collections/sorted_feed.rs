//! Explicitly ordered feed.
//!
//! Ids come from a per-feed counter and live in a list whose order is only
//! changed by positional inserts and moves. Every change announces the item's
//! new neighbour on the `position` channel so subscribers can mirror the order.

use async_trait::async_trait;
use tracing::debug;

use super::{Collection, FeedCore};
use crate::bus::{EventKind, Position};
use crate::error::{Error, Result};
use crate::interfaces::{Command, Reply, Store, StoreExt};
use crate::keys;
use crate::transaction::{Guarded, Probe, Transaction};

/// Target of [`SortedFeed::move_to`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Immediately before the given id.
    Before(String),
    /// Immediately after the given id.
    After(String),
    Begin,
    End,
}

impl Placement {
    fn relative_to<'a>(&'a self, id: &'a str) -> &'a str {
        match self {
            Placement::Before(relative) | Placement::After(relative) => relative,
            Placement::Begin | Placement::End => id,
        }
    }

    /// Announced position of the moved item.
    fn position(&self) -> Position {
        match self {
            Placement::Before(relative) => Position::Before(relative.clone()),
            Placement::After(relative) => Position::After(relative.clone()),
            Placement::Begin => Position::Begin,
            Placement::End => Position::End,
        }
    }
}

#[derive(Clone)]
pub struct SortedFeed {
    core: FeedCore,
}

impl SortedFeed {
    pub(crate) fn new(core: FeedCore) -> Self {
        Self { core }
    }

    /// Add `item` at the end.
    pub async fn append(&self, item: &str) -> Result<String> {
        self.push(item, false).await
    }

    /// Add `item` at the beginning.
    pub async fn prepend(&self, item: &str) -> Result<String> {
        self.push(item, true).await
    }

    /// Same as [`SortedFeed::append`].
    pub async fn publish(&self, item: &str) -> Result<String> {
        self.append(item).await
    }

    #[tracing::instrument(name = "sorted_feed.push", skip_all, fields(feed = %self.core.name(), front = front))]
    async fn push(&self, item: &str, front: bool) -> Result<String> {
        let registry = self.core.registry()?;
        let runner = registry.runner();
        let _guard = runner.lock().acquire("sorted_feed.push").await;

        let id = runner
            .store()
            .incr(&keys::idincr(self.core.name()))
            .await?
            .to_string();
        let (command, position) = if front {
            (
                Command::LPush {
                    key: self.core.ids(),
                    value: id.clone(),
                },
                Position::Begin,
            )
        } else {
            (
                Command::RPush {
                    key: self.core.ids(),
                    value: id.clone(),
                },
                Position::End,
            )
        };

        let mut commands = vec![command];
        commands.extend(self.announce_new(&id, item, &position));
        runner.exec_locked(commands).await?;
        debug!(id = %id, position = %position, "Published");
        Ok(id)
    }

    /// Insert `item` immediately before `before_id`.
    pub async fn publish_before(&self, before_id: &str, item: &str) -> Result<String> {
        self.insert(before_id, item, true).await
    }

    /// Insert `item` immediately after `after_id`.
    pub async fn publish_after(&self, after_id: &str, item: &str) -> Result<String> {
        self.insert(after_id, item, false).await
    }

    #[tracing::instrument(name = "sorted_feed.insert", skip_all, fields(feed = %self.core.name(), before = before))]
    async fn insert(&self, relative: &str, item: &str, before: bool) -> Result<String> {
        let registry = self.core.registry()?;
        let tx = Insert {
            feed: self,
            relative: relative.to_string(),
            item: item.to_string(),
            before,
        };
        registry.runner().run(&tx).await
    }

    /// Replace the payload of an existing item.
    #[tracing::instrument(name = "sorted_feed.edit", skip_all, fields(feed = %self.core.name()))]
    pub async fn edit(&self, id: &str, item: &str) -> Result<()> {
        let registry = self.core.registry()?;
        let core = self.core.clone();
        let missing = id.to_string();
        let tx = Guarded::new(
            "sorted_feed.edit",
            Probe::HashField {
                key: self.core.items(),
                field: id.to_string(),
            },
            vec![
                Command::HSet {
                    key: self.core.items(),
                    field: id.to_string(),
                    value: item.to_string(),
                },
                Command::Incr(keys::publishes(self.core.name())),
                Command::Publish {
                    channel: self.core.channel(EventKind::Edit),
                    message: keys::join(id, item),
                },
            ],
            move || core.does_not_exist(&missing),
        );
        registry.runner().run(&tx).await?;
        Ok(())
    }

    #[tracing::instrument(name = "sorted_feed.retract", skip_all, fields(feed = %self.core.name()))]
    pub async fn retract(&self, id: &str) -> Result<()> {
        let registry = self.core.registry()?;
        let core = self.core.clone();
        let missing = id.to_string();
        let tx = Guarded::new(
            "sorted_feed.retract",
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

    /// Move an existing item.
    ///
    /// Fails with `NoChange` when asked to move an item next to itself and
    /// with `DoesNotExist` when either item is missing.
    #[tracing::instrument(name = "sorted_feed.move", skip_all, fields(feed = %self.core.name()))]
    pub async fn move_to(&self, id: &str, placement: Placement) -> Result<()> {
        if matches!(&placement, Placement::Before(r) | Placement::After(r) if r == id) {
            return Err(Error::NoChange {
                feed: self.core.name().to_string(),
                id: id.to_string(),
            });
        }
        let registry = self.core.registry()?;
        let tx = Move {
            core: &self.core,
            id: id.to_string(),
            placement,
        };
        registry.runner().run(&tx).await
    }

    pub async fn move_before(&self, id: &str, before_id: &str) -> Result<()> {
        self.move_to(id, Placement::Before(before_id.to_string())).await
    }

    pub async fn move_after(&self, id: &str, after_id: &str) -> Result<()> {
        self.move_to(id, Placement::After(after_id.to_string())).await
    }

    pub async fn move_begin(&self, id: &str) -> Result<()> {
        self.move_to(id, Placement::Begin).await
    }

    pub async fn move_end(&self, id: &str) -> Result<()> {
        self.move_to(id, Placement::End).await
    }

    /// Writes shared by every way of adding an item, after the list insert.
    fn announce_new(&self, id: &str, item: &str, position: &Position) -> Vec<Command> {
        vec![
            Command::HSet {
                key: self.core.items(),
                field: id.to_string(),
                value: item.to_string(),
            },
            Command::Incr(keys::publishes(self.core.name())),
            Command::Publish {
                channel: self.core.channel(EventKind::Publish),
                message: keys::join(id, item),
            },
            Command::Publish {
                channel: self.core.channel(EventKind::Position),
                message: keys::join(id, &position.to_string()),
            },
        ]
    }

    /// Every `(id, item)` pair in list order, read as one snapshot.
    pub async fn get_all(&self) -> Result<Vec<(String, String)>> {
        self.core
            .snapshot(
                "sorted_feed.get_all",
                Command::LRange {
                    key: self.core.ids(),
                    start: 0,
                    stop: -1,
                },
            )
            .await
    }
}

#[async_trait]
impl Collection for SortedFeed {
    fn core(&self) -> &FeedCore {
        &self.core
    }

    async fn get_ids(&self) -> Result<Vec<String>> {
        let registry = self.core.registry()?;
        registry.runner().store().lrange(&self.core.ids(), 0, -1).await
    }
}

struct Insert<'a> {
    feed: &'a SortedFeed,
    relative: String,
    item: String,
    before: bool,
}

#[async_trait]
impl Transaction for Insert<'_> {
    /// Id reserved for the new item.
    type State = String;
    type Output = String;

    fn name(&self) -> &'static str {
        "sorted_feed.insert"
    }

    fn watched(&self) -> Vec<String> {
        vec![self.feed.core.items()]
    }

    async fn read(&self, store: &dyn Store) -> Result<String> {
        let core = &self.feed.core;
        if !store.hexists(&core.items(), &self.relative).await? {
            return Err(core.does_not_exist(&self.relative));
        }
        Ok(store.incr(&keys::idincr(core.name())).await?.to_string())
    }

    fn write(&self, id: &String) -> Vec<Command> {
        let position = if self.before {
            Position::Before(self.relative.clone())
        } else {
            Position::After(self.relative.clone())
        };
        let mut commands = vec![Command::LInsert {
            key: self.feed.core.ids(),
            before: self.before,
            pivot: self.relative.clone(),
            value: id.clone(),
        }];
        commands.extend(self.feed.announce_new(id, &self.item, &position));
        commands
    }

    fn commit(&self, id: String, _replies: Vec<Reply>) -> Result<String> {
        debug!(id = %id, relative = %self.relative, before = self.before, "Inserted");
        Ok(id)
    }
}

struct Move<'a> {
    core: &'a FeedCore,
    id: String,
    placement: Placement,
}

#[async_trait]
impl Transaction for Move<'_> {
    type State = ();
    type Output = ();

    fn name(&self) -> &'static str {
        "sorted_feed.move"
    }

    fn watched(&self) -> Vec<String> {
        vec![self.core.items()]
    }

    async fn read(&self, store: &dyn Store) -> Result<()> {
        let items = self.core.items();
        let relative = self.placement.relative_to(&self.id);
        if !store.hexists(&items, relative).await? {
            return Err(self.core.does_not_exist(relative));
        }
        if !store.hexists(&items, &self.id).await? {
            return Err(self.core.does_not_exist(&self.id));
        }
        Ok(())
    }

    fn write(&self, _state: &()) -> Vec<Command> {
        let ids = self.core.ids();
        let placed = match &self.placement {
            Placement::Before(relative) | Placement::After(relative) => Command::LInsert {
                key: ids.clone(),
                before: matches!(self.placement, Placement::Before(_)),
                pivot: relative.clone(),
                value: self.id.clone(),
            },
            Placement::Begin => Command::LPush {
                key: ids.clone(),
                value: self.id.clone(),
            },
            Placement::End => Command::RPush {
                key: ids.clone(),
                value: self.id.clone(),
            },
        };
        vec![
            Command::LRem {
                key: ids,
                count: 1,
                value: self.id.clone(),
            },
            placed,
            Command::Publish {
                channel: self.core.channel(EventKind::Position),
                message: keys::join(&self.id, &self.placement.position().to_string()),
            },
        ]
    }

    fn commit(&self, _state: (), _replies: Vec<Reply>) -> Result<()> {
        debug!(id = %self.id, placement = ?self.placement, "Moved");
        Ok(())
    }
}
