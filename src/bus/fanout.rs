//! Reference-counted channel and pattern subscriptions.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::event::{Event, NoticeKind, SystemNotice};
use crate::error::Result;
use crate::interfaces::{ChannelMessage, PubSub};
use crate::keys::{self, EventKind};

/// A store-level subscription shared by local listeners.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Channel(String),
    Pattern(String),
}

impl Target {
    /// One channel per kind on a single feed.
    pub fn feed(feed: &str, kinds: &[EventKind]) -> Vec<Target> {
        kinds
            .iter()
            .map(|kind| Target::Channel(keys::channel(*kind, feed)))
            .collect()
    }

    /// One pattern per kind across every feed whose name matches `glob`.
    pub fn namespace(glob: &str, kinds: &[EventKind]) -> Vec<Target> {
        kinds
            .iter()
            .map(|kind| Target::Pattern(keys::channel(*kind, glob)))
            .collect()
    }
}

struct Listener {
    id: u64,
    /// Only deliver events for this item.
    item: Option<String>,
    sender: mpsc::UnboundedSender<Event>,
}

/// Demultiplexes listener-connection traffic into local subscriptions.
pub struct EventFanout {
    pubsub: Arc<dyn PubSub>,
    /// Logical subscribers per store-level subscription. Held across the
    /// store round-trip so that first/last transitions are not interleaved.
    refs: Mutex<HashMap<Target, usize>>,
    listeners: RwLock<HashMap<Target, Vec<Listener>>>,
    next_id: AtomicU64,
    warn_threshold: usize,
}

impl EventFanout {
    /// Start dispatching `messages`.
    ///
    /// Registry notices are forwarded to the returned receiver; everything
    /// else goes to local subscriptions.
    pub fn start(
        pubsub: Arc<dyn PubSub>,
        messages: mpsc::UnboundedReceiver<ChannelMessage>,
        warn_threshold: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SystemNotice>, JoinHandle<()>) {
        let fanout = Arc::new(Self {
            pubsub,
            refs: Mutex::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            warn_threshold,
        });
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(dispatch(Arc::downgrade(&fanout), messages, notice_tx));
        (fanout, notice_rx, handle)
    }

    /// Subscribe to the registry notice channels.
    pub async fn subscribe_notices(&self) -> Result<()> {
        for channel in NoticeKind::CHANNELS {
            self.pubsub.subscribe(channel).await?;
        }
        Ok(())
    }

    /// Register a listener on `targets` and make sure the store delivers them.
    ///
    /// Resolves once every underlying subscription is acknowledged, so events
    /// published afterwards are not missed.
    pub async fn subscribe(
        self: &Arc<Self>,
        targets: Vec<Target>,
        item: Option<String>,
    ) -> Result<Subscription> {
        let (sender, events) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        {
            let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
            for target in &targets {
                let list = listeners.entry(target.clone()).or_default();
                list.push(Listener {
                    id,
                    item: item.clone(),
                    sender: sender.clone(),
                });
                if list.len() > self.warn_threshold {
                    warn!(
                        target = ?target,
                        listeners = list.len(),
                        threshold = self.warn_threshold,
                        "Many local listeners on one subscription"
                    );
                }
            }
        }

        for (acquired, target) in targets.iter().enumerate() {
            if let Err(e) = self.acquire(target).await {
                self.detach(id, &targets);
                for target in &targets[..acquired] {
                    if let Err(release) = self.release(target).await {
                        warn!(target = ?target, error = %release, "Failed to roll back subscription");
                    }
                }
                return Err(e);
            }
        }

        Ok(Subscription {
            id,
            targets,
            events,
            fanout: Arc::downgrade(self),
            released: false,
        })
    }

    async fn acquire(&self, target: &Target) -> Result<()> {
        let mut refs = self.refs.lock().await;
        let current = refs.get(target).copied().unwrap_or(0);
        if current == 0 {
            match target {
                Target::Channel(channel) => self.pubsub.subscribe(channel).await?,
                Target::Pattern(pattern) => self.pubsub.psubscribe(pattern).await?,
            }
            debug!(target = ?target, "Subscribed");
        }
        refs.insert(target.clone(), current + 1);
        Ok(())
    }

    async fn release(&self, target: &Target) -> Result<()> {
        let mut refs = self.refs.lock().await;
        match refs.get_mut(target) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                refs.remove(target);
                match target {
                    Target::Channel(channel) => self.pubsub.unsubscribe(channel).await?,
                    Target::Pattern(pattern) => self.pubsub.punsubscribe(pattern).await?,
                }
                debug!(target = ?target, "Unsubscribed");
            }
            None => {}
        }
        Ok(())
    }

    fn detach(&self, id: u64, targets: &[Target]) {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        for target in targets {
            if let Some(list) = listeners.get_mut(target) {
                list.retain(|listener| listener.id != id);
                if list.is_empty() {
                    listeners.remove(target);
                }
            }
        }
    }

    /// Logical subscribers on a store-level subscription.
    pub async fn ref_count(&self, target: &Target) -> usize {
        self.refs.lock().await.get(target).copied().unwrap_or(0)
    }

    /// Local listeners currently attached to a target.
    pub fn listener_count(&self, target: &Target) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .map_or(0, Vec::len)
    }

    fn deliver(&self, message: &ChannelMessage) {
        let Some(event) = Event::parse(&message.channel, &message.payload) else {
            debug!(channel = %message.channel, "Ignoring message on unknown channel");
            return;
        };
        let target = match &message.pattern {
            Some(pattern) => Target::Pattern(pattern.clone()),
            None => Target::Channel(message.channel.clone()),
        };

        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = listeners.get(&target) else {
            return;
        };
        for listener in list {
            if listener.item.as_deref().is_some_and(|item| item != event.id()) {
                continue;
            }
            // A closed receiver is detached by its subscription's drop.
            let _ = listener.sender.send(event.clone());
        }
    }

    fn close_all(&self) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

async fn dispatch(
    fanout: Weak<EventFanout>,
    mut messages: mpsc::UnboundedReceiver<ChannelMessage>,
    notices: mpsc::UnboundedSender<SystemNotice>,
) {
    while let Some(message) = messages.recv().await {
        if let Some(notice) = SystemNotice::parse(&message.channel, &message.payload) {
            let _ = notices.send(notice);
            continue;
        }
        match fanout.upgrade() {
            Some(fanout) => fanout.deliver(&message),
            None => return,
        }
    }

    error!("Pub/sub listener connection lost; closing subscriptions");
    if let Some(fanout) = fanout.upgrade() {
        fanout.close_all();
    }
}

/// A stream of events for one subscribe call.
///
/// Dropping it releases the underlying store subscriptions in the
/// background; [`Subscription::unsubscribe`] does the same and waits for it.
pub struct Subscription {
    id: u64,
    targets: Vec<Target>,
    events: mpsc::UnboundedReceiver<Event>,
    fanout: Weak<EventFanout>,
    released: bool,
}

impl Subscription {
    /// Next event, or `None` once the listener connection is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Next already-delivered event, if any.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.events.try_recv().ok()
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub async fn unsubscribe(mut self) -> Result<()> {
        self.released = true;
        let targets = std::mem::take(&mut self.targets);
        let Some(fanout) = self.fanout.upgrade() else {
            return Ok(());
        };
        fanout.detach(self.id, &targets);
        for target in &targets {
            fanout.release(target).await?;
        }
        Ok(())
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(fanout) = self.fanout.upgrade() else {
            return;
        };
        let targets = std::mem::take(&mut self.targets);
        fanout.detach(self.id, &targets);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for target in &targets {
                        if let Err(e) = fanout.release(target).await {
                            warn!(target = ?target, error = %e, "Failed to release dropped subscription");
                        }
                    }
                });
            }
            Err(_) => warn!("Subscription dropped outside a runtime; store subscription kept"),
        }
    }
}
