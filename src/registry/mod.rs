//! Registry: the root object every collection handle is opened from.
//!
//! Owns the primary and listener connections plus the connector that
//! queue and job handles open their blocking connections through, the
//! instance id used to recognise this process's own broadcasts, and the
//! per-feed configuration cache. The cache is kept current by the
//! `newfeed`/`delfeed`/`conffeed` notices other processes publish.

mod feed_config;


pub use feed_config::{FeedConfig, FeedType};

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{EventFanout, EventKind, NoticeKind, Subscription, SystemNotice, Target};
use crate::collections::{Feed, FeedCore, Job, Queue, SortedFeed};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::interfaces::{Command, Connector, Reply, Store, StoreExt};
use crate::keys;
use crate::storage;
use crate::transaction::{Guarded, Probe, Runner, SerialLock, Transaction};
use crate::utils::bootstrap::connect_with_retry;

const EVENT_CAPACITY: usize = 256;

/// Feed lifecycle change, local or from another process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Created(String),
    Deleted(String),
    Configured(String),
}

impl From<&SystemNotice> for RegistryEvent {
    fn from(notice: &SystemNotice) -> Self {
        let feed = notice.feed.clone();
        match notice.kind {
            NoticeKind::Created => RegistryEvent::Created(feed),
            NoticeKind::Deleted => RegistryEvent::Deleted(feed),
            NoticeKind::Configured => RegistryEvent::Configured(feed),
        }
    }
}

/// Shared state behind every collection handle.
pub struct Registry {
    instance: String,
    runner: Runner,
    connector: Arc<dyn Connector>,
    address: String,
    fanout: Arc<EventFanout>,
    feeds: RwLock<HashMap<String, FeedConfig>>,
    events: broadcast::Sender<RegistryEvent>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Registry {
    /// Connect using the store named in `config`.
    pub async fn connect(config: &Config) -> Result<Arc<Self>> {
        let connector = storage::init_connector(&config.store)?;
        Self::with_connector(connector, config).await
    }

    /// Open primary and listener connections through `connector`.
    pub async fn with_connector(connector: Arc<dyn Connector>, config: &Config) -> Result<Arc<Self>> {
        let address = config.store.store_type.to_string();
        let primary = connect_with_retry("primary", &address, || connector.connect()).await?;
        let (pubsub, messages) =
            connect_with_retry("listener", &address, || connector.listen()).await?;

        let (fanout, notices, dispatch) =
            EventFanout::start(pubsub, messages, config.fanout.listener_warn_threshold);
        fanout.subscribe_notices().await?;

        let lock = SerialLock::new(std::time::Duration::from_millis(config.retry.lock_stall_ms));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Arc::new(Self {
            instance: Uuid::new_v4().to_string(),
            runner: Runner::new(primary, lock, config.retry.clone()),
            connector,
            address,
            fanout,
            feeds: RwLock::new(HashMap::new()),
            events,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let watcher = tokio::spawn(watch_notices(Arc::downgrade(&registry), notices));
        registry
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([dispatch, watcher]);

        info!(instance = %registry.instance, store = %registry.address, "Registry connected");
        Ok(registry)
    }

    /// Random id tagging this registry's broadcasts.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Open a fresh connection for blocking pops.
    ///
    /// A blocking pop occupies its connection until it returns, so every
    /// queue or job handle pops on one of its own.
    pub async fn open_blocking(&self) -> Result<Arc<dyn Store>> {
        let store = self.connector.connect().await?;
        debug!(store = %self.address, "Opened blocking connection");
        Ok(store)
    }

    pub fn fanout(&self) -> &Arc<EventFanout> {
        &self.fanout
    }

    /// Feed lifecycle events from this and every other process.
    pub fn events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register `name` with `config` if it is not registered yet.
    ///
    /// Returns whether this call created it.
    #[tracing::instrument(name = "registry.create", skip_all, fields(feed = %name))]
    pub async fn create(&self, name: &str, config: FeedConfig) -> Result<bool> {
        let tx = CreateFeed {
            name: name.to_string(),
            json: config.to_json()?,
            notice: SystemNotice::body(name, &self.instance),
        };
        let created = self.runner.run(&tx).await?;
        if created {
            info!(feed = %name, feed_type = %config.feed_type, "Feed created");
            self.feeds.write().await.insert(name.to_string(), config);
        }
        Ok(created)
    }

    /// Overwrite the stored configuration of `name`.
    #[tracing::instrument(name = "registry.set_config", skip_all, fields(feed = %name))]
    pub async fn set_config(&self, name: &str, config: FeedConfig) -> Result<()> {
        let commands = vec![
            Command::Set {
                key: keys::config(name),
                value: config.to_json()?,
            },
            Command::Publish {
                channel: keys::CONF_FEED.to_string(),
                message: SystemNotice::body(name, &self.instance),
            },
        ];
        {
            let _guard = self.runner.lock().acquire("registry.set_config").await;
            self.runner.exec_locked(commands).await?;
        }
        self.feeds.write().await.insert(name.to_string(), config);
        Ok(())
    }

    /// Configuration of `name`, from the cache when possible.
    pub async fn config(&self, name: &str) -> Result<FeedConfig> {
        if let Some(config) = self.feeds.read().await.get(name) {
            return Ok(config.clone());
        }
        let config = self.load_config(name).await?;
        self.feeds.write().await.insert(name.to_string(), config.clone());
        Ok(config)
    }

    async fn load_config(&self, name: &str) -> Result<FeedConfig> {
        let json = self
            .runner
            .store()
            .get(&keys::config(name))
            .await?
            .ok_or_else(|| Error::FeedNotFound(name.to_string()))?;
        FeedConfig::from_json(&json)
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        self.runner.store().sismember(keys::FEEDS, name).await
    }

    pub async fn feed_names(&self) -> Result<Vec<String>> {
        let mut names = self.runner.store().smembers(keys::FEEDS).await?;
        names.sort();
        Ok(names)
    }

    /// Remove `name` and every key it owns.
    #[tracing::instrument(name = "registry.delete_feed", skip_all, fields(feed = %name))]
    pub async fn delete_feed(&self, name: &str) -> Result<()> {
        let commands = vec![
            Command::SRem {
                key: keys::FEEDS.to_string(),
                member: name.to_string(),
            },
            Command::Del(keys::all(name)),
            Command::Publish {
                channel: keys::DEL_FEED.to_string(),
                message: SystemNotice::body(name, &self.instance),
            },
        ];

        let missing = name.to_string();
        let tx = Guarded::new(
            "registry.delete_feed",
            Probe::SetMember {
                key: keys::FEEDS.to_string(),
                member: name.to_string(),
            },
            commands,
            move || Error::FeedNotFound(missing.clone()),
        );
        self.runner.run(&tx).await?;
        self.feeds.write().await.remove(name);
        info!(feed = %name, "Feed deleted");
        Ok(())
    }

    /// Events of `kinds` from every feed whose name matches `glob`.
    pub async fn namespace_subscribe(&self, glob: &str, kinds: &[EventKind]) -> Result<Subscription> {
        self.fanout.subscribe(Target::namespace(glob, kinds), None).await
    }

    pub async fn feed(self: &Arc<Self>, name: &str, config: Option<FeedConfig>) -> Result<Feed> {
        Ok(Feed::new(self.open(name, FeedType::Feed, config).await?))
    }

    pub async fn sorted_feed(
        self: &Arc<Self>,
        name: &str,
        config: Option<FeedConfig>,
    ) -> Result<SortedFeed> {
        Ok(SortedFeed::new(self.open(name, FeedType::SortedFeed, config).await?))
    }

    pub async fn queue(self: &Arc<Self>, name: &str, config: Option<FeedConfig>) -> Result<Queue> {
        Ok(Queue::new(self.open(name, FeedType::Queue, config).await?))
    }

    pub async fn job(self: &Arc<Self>, name: &str, config: Option<FeedConfig>) -> Result<Job> {
        Ok(Job::new(self.open(name, FeedType::Job, config).await?))
    }

    /// Create the feed or check the existing one has the expected type.
    ///
    /// An explicit `config` overwrites the stored one.
    async fn open(
        self: &Arc<Self>,
        name: &str,
        expected: FeedType,
        config: Option<FeedConfig>,
    ) -> Result<FeedCore> {
        let requested = config.map(|mut config| {
            config.feed_type = expected;
            config
        });

        let created = self
            .create(name, requested.clone().unwrap_or_else(|| FeedConfig::new(expected)))
            .await?;
        if !created {
            let actual = self.config(name).await?.feed_type;
            if actual != expected {
                return Err(Error::TypeMismatch {
                    feed: name.to_string(),
                    expected,
                    actual,
                });
            }
            if let Some(config) = requested {
                self.set_config(name, config).await?;
            }
        }

        debug!(feed = %name, feed_type = %expected, created, "Opened feed");
        Ok(FeedCore::new(name, Arc::downgrade(self)))
    }

    async fn apply_notice(&self, notice: &SystemNotice) {
        if notice.instance != self.instance {
            match notice.kind {
                NoticeKind::Created | NoticeKind::Configured => {
                    match self.load_config(&notice.feed).await {
                        Ok(config) => {
                            self.feeds.write().await.insert(notice.feed.clone(), config);
                        }
                        Err(e) => {
                            warn!(feed = %notice.feed, error = %e, "Failed to reload feed config");
                            self.feeds.write().await.remove(&notice.feed);
                        }
                    }
                }
                NoticeKind::Deleted => {
                    self.feeds.write().await.remove(&notice.feed);
                }
            }
        }
        // No receivers is fine.
        let _ = self.events.send(RegistryEvent::from(notice));
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

async fn watch_notices(registry: Weak<Registry>, mut notices: mpsc::UnboundedReceiver<SystemNotice>) {
    while let Some(notice) = notices.recv().await {
        let Some(registry) = registry.upgrade() else {
            return;
        };
        debug!(kind = ?notice.kind, feed = %notice.feed, origin = %notice.instance, "Registry notice");
        registry.apply_notice(&notice).await;
    }
}

/// SADD to `feeds`, writing the config only when the name is new.
struct CreateFeed {
    name: String,
    json: String,
    notice: String,
}

#[async_trait]
impl Transaction for CreateFeed {
    type State = bool;
    type Output = bool;

    fn name(&self) -> &'static str {
        "registry.create"
    }

    fn watched(&self) -> Vec<String> {
        vec![keys::FEEDS.to_string()]
    }

    async fn read(&self, store: &dyn Store) -> Result<bool> {
        store.sismember(keys::FEEDS, &self.name).await
    }

    fn write(&self, exists: &bool) -> Vec<Command> {
        if *exists {
            return Vec::new();
        }
        vec![
            Command::SAdd {
                key: keys::FEEDS.to_string(),
                member: self.name.clone(),
            },
            Command::Set {
                key: keys::config(&self.name),
                value: self.json.clone(),
            },
            Command::Publish {
                channel: keys::NEW_FEED.to_string(),
                message: self.notice.clone(),
            },
        ]
    }

    fn commit(&self, exists: bool, replies: Vec<Reply>) -> Result<bool> {
        if exists {
            return Ok(false);
        }
        match replies.into_iter().next() {
            Some(reply) => reply.into_bool("SADD"),
            None => Err(Error::UnexpectedReply {
                command: "EXEC",
                reply: "no reply to SADD".to_string(),
            }),
        }
    }
}
