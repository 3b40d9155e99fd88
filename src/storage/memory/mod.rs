//! In-process store.
//!
//! Implements the full store contract inside one process: typed values,
//! per-connection WATCH state with version checks on EXEC, blocking list pops
//! and channel/pattern pub/sub. Like a server connection, each connection
//! runs one command at a time, so a pending blocking pop holds up everything
//! else sent on it. Every connection opened from the same
//! [`MemoryStore`] sees the same data, so several registries built on one
//! `MemoryStore` behave like several processes sharing one server.
//!
//! Test hooks simulate the conditions that are hard to provoke against a real
//! server: a concurrent writer landing between WATCH and EXEC
//! ([`MemoryStore::interfere`]) and a lost connection ([`MemoryStore::set_offline`]).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::debug;

use crate::error::{Error, Result};
use crate::interfaces::{ChannelMessage, Command, Connector, PubSub, Reply, Store};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(HashSet<String>),
    ZSet(HashMap<String, f64>),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::Set(s) => s.is_empty(),
            Value::ZSet(z) => z.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Hash(h) => h.is_empty(),
        }
    }
}

#[derive(Default)]
struct Data {
    values: HashMap<String, Value>,
    /// Bumped on every modification; absent means never written.
    versions: HashMap<String, u64>,
    clock: u64,
    /// Commands applied just before the next EXEC that watched the key.
    interference: HashMap<String, Vec<Command>>,
    pushed: bool,
}

struct ListenerEntry {
    channels: HashSet<String>,
    patterns: BTreeMap<String, glob::Pattern>,
    sender: mpsc::UnboundedSender<ChannelMessage>,
}

#[derive(Default)]
struct Shared {
    data: Mutex<Data>,
    listeners: Mutex<HashMap<u64, ListenerEntry>>,
    pushed: Notify,
    offline: AtomicBool,
    aborted: AtomicU64,
    next_listener: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Store("connection refused: store offline".to_string()));
        }
        Ok(())
    }

    fn deliver(&self, channel: &str, payload: &str) -> i64 {
        let listeners = lock(&self.listeners);
        let mut receivers = 0;
        for entry in listeners.values() {
            if entry.channels.contains(channel) {
                let sent = entry.sender.send(ChannelMessage {
                    pattern: None,
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                });
                if sent.is_ok() {
                    receivers += 1;
                }
            }
            for (raw, pattern) in &entry.patterns {
                if pattern.matches(channel) {
                    let sent = entry.sender.send(ChannelMessage {
                        pattern: Some(raw.clone()),
                        channel: channel.to_string(),
                        payload: payload.to_string(),
                    });
                    if sent.is_ok() {
                        receivers += 1;
                    }
                }
            }
        }
        receivers
    }

    /// Wake blocked pops if the last batch pushed anything.
    fn wake(&self, data: &mut Data) {
        if std::mem::take(&mut data.pushed) {
            self.pushed.notify_waiters();
        }
    }
}

/// Resolve Redis-style inclusive, possibly negative, range bounds.
fn range_bounds(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

fn wrong_type(command: &Command) -> Error {
    Error::Store(format!(
        "WRONGTYPE {} against a key holding the wrong kind of value",
        command.name()
    ))
}

impl Data {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn touch(&mut self, key: &str) {
        self.clock += 1;
        self.versions.insert(key.to_string(), self.clock);
        if self.values.get(key).is_some_and(Value::is_empty) {
            self.values.remove(key);
        }
    }

    fn set_mut(&mut self, key: &str, command: &Command) -> Result<&mut HashSet<String>> {
        match self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Set(HashSet::new()))
        {
            Value::Set(s) => Ok(s),
            _ => Err(wrong_type(command)),
        }
    }

    fn zset_mut(&mut self, key: &str, command: &Command) -> Result<&mut HashMap<String, f64>> {
        match self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::ZSet(HashMap::new()))
        {
            Value::ZSet(z) => Ok(z),
            _ => Err(wrong_type(command)),
        }
    }

    fn list_mut(&mut self, key: &str, command: &Command) -> Result<&mut VecDeque<String>> {
        match self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()))
        {
            Value::List(l) => Ok(l),
            _ => Err(wrong_type(command)),
        }
    }

    fn hash_mut(&mut self, key: &str, command: &Command) -> Result<&mut HashMap<String, String>> {
        match self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(HashMap::new()))
        {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type(command)),
        }
    }

    /// Read-only view; `None` when the key does not exist.
    fn read(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    fn apply(&mut self, shared: &Shared, command: &Command) -> Result<Reply> {
        let reply = match command {
            Command::Get(key) => match self.read(key) {
                None => Reply::Nil,
                Some(Value::Str(s)) => Reply::Data(s.clone()),
                Some(_) => return Err(wrong_type(command)),
            },
            Command::Set { key, value } => {
                self.values.insert(key.clone(), Value::Str(value.clone()));
                self.touch(key);
                Reply::Ok
            }
            Command::Del(keys) => {
                let mut removed = 0;
                for key in keys {
                    if self.values.remove(key).is_some() {
                        removed += 1;
                        self.touch(key);
                    }
                }
                Reply::Int(removed)
            }
            Command::Incr(key) => {
                let current = match self.read(key) {
                    None => 0,
                    Some(Value::Str(s)) => s.parse::<i64>().map_err(|_| {
                        Error::Store("ERR value is not an integer or out of range".to_string())
                    })?,
                    Some(_) => return Err(wrong_type(command)),
                };
                let next = current + 1;
                self.values.insert(key.clone(), Value::Str(next.to_string()));
                self.touch(key);
                Reply::Int(next)
            }

            Command::SAdd { key, member } => {
                let added = self.set_mut(key, command)?.insert(member.clone());
                if added {
                    self.touch(key);
                }
                Reply::Int(added as i64)
            }
            Command::SRem { key, member } => {
                let removed = self.values.contains_key(key)
                    && self.set_mut(key, command)?.remove(member);
                if removed {
                    self.touch(key);
                }
                Reply::Int(removed as i64)
            }
            Command::SIsMember { key, member } => match self.read(key) {
                None => Reply::Int(0),
                Some(Value::Set(s)) => Reply::Int(s.contains(member) as i64),
                Some(_) => return Err(wrong_type(command)),
            },
            Command::SMembers(key) => match self.read(key) {
                None => Reply::Array(Vec::new()),
                Some(Value::Set(s)) => {
                    let mut members: Vec<String> = s.iter().cloned().collect();
                    members.sort();
                    Reply::Array(members)
                }
                Some(_) => return Err(wrong_type(command)),
            },

            Command::ZAdd {
                key,
                score,
                member,
                nx,
            } => {
                let zset = self.zset_mut(key, command)?;
                let existed = zset.contains_key(member);
                let changed = if existed && *nx {
                    false
                } else {
                    zset.insert(member.clone(), *score) != Some(*score)
                };
                if changed {
                    self.touch(key);
                }
                Reply::Int((!existed) as i64)
            }
            Command::ZRem { key, member } => {
                let removed = self.values.contains_key(key)
                    && self.zset_mut(key, command)?.remove(member).is_some();
                if removed {
                    self.touch(key);
                }
                Reply::Int(removed as i64)
            }
            Command::ZScore { key, member } => match self.read(key) {
                None => Reply::Nil,
                Some(Value::ZSet(z)) => match z.get(member) {
                    Some(score) => Reply::Data(crate::interfaces::command::format_score(*score)),
                    None => Reply::Nil,
                },
                Some(_) => return Err(wrong_type(command)),
            },
            Command::ZCard(key) => match self.read(key) {
                None => Reply::Int(0),
                Some(Value::ZSet(z)) => Reply::Int(z.len() as i64),
                Some(_) => return Err(wrong_type(command)),
            },
            Command::ZRange {
                key,
                start,
                stop,
                withscores,
            } => {
                let mut ordered: Vec<(String, f64)> = match self.read(key) {
                    None => Vec::new(),
                    Some(Value::ZSet(z)) => z.iter().map(|(m, s)| (m.clone(), *s)).collect(),
                    Some(_) => return Err(wrong_type(command)),
                };
                ordered.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                let slice = match range_bounds(ordered.len(), *start, *stop) {
                    Some((from, to)) => ordered[from..=to].to_vec(),
                    None => Vec::new(),
                };
                if *withscores {
                    Reply::Scored(slice)
                } else {
                    Reply::Array(slice.into_iter().map(|(m, _)| m).collect())
                }
            }

            Command::LPush { key, value } => {
                let list = self.list_mut(key, command)?;
                list.push_front(value.clone());
                let len = list.len() as i64;
                self.touch(key);
                self.pushed = true;
                Reply::Int(len)
            }
            Command::RPush { key, value } => {
                let list = self.list_mut(key, command)?;
                list.push_back(value.clone());
                let len = list.len() as i64;
                self.touch(key);
                self.pushed = true;
                Reply::Int(len)
            }
            Command::LRem { key, count, value } => {
                if self.read(key).is_none() {
                    return Ok(Reply::Int(0));
                }
                let list = self.list_mut(key, command)?;
                let limit = if *count == 0 {
                    usize::MAX
                } else {
                    count.unsigned_abs()
                };
                let mut removed = 0usize;
                if *count >= 0 {
                    let mut i = 0;
                    while i < list.len() && removed < limit {
                        if list[i] == *value {
                            list.remove(i);
                            removed += 1;
                        } else {
                            i += 1;
                        }
                    }
                } else {
                    let mut i = list.len();
                    while i > 0 && removed < limit {
                        i -= 1;
                        if list[i] == *value {
                            list.remove(i);
                            removed += 1;
                        }
                    }
                }
                if removed > 0 {
                    self.touch(key);
                }
                Reply::Int(removed as i64)
            }
            Command::LInsert {
                key,
                before,
                pivot,
                value,
            } => {
                if self.read(key).is_none() {
                    return Ok(Reply::Int(0));
                }
                let list = self.list_mut(key, command)?;
                match list.iter().position(|v| v == pivot) {
                    Some(at) => {
                        let index = if *before { at } else { at + 1 };
                        list.insert(index, value.clone());
                        let len = list.len() as i64;
                        self.touch(key);
                        self.pushed = true;
                        Reply::Int(len)
                    }
                    None => Reply::Int(-1),
                }
            }
            Command::LRange { key, start, stop } => match self.read(key) {
                None => Reply::Array(Vec::new()),
                Some(Value::List(l)) => match range_bounds(l.len(), *start, *stop) {
                    Some((from, to)) => Reply::Array(l.range(from..=to).cloned().collect()),
                    None => Reply::Array(Vec::new()),
                },
                Some(_) => return Err(wrong_type(command)),
            },
            Command::LLen(key) => match self.read(key) {
                None => Reply::Int(0),
                Some(Value::List(l)) => Reply::Int(l.len() as i64),
                Some(_) => return Err(wrong_type(command)),
            },

            Command::HSet { key, field, value } => {
                let added = self
                    .hash_mut(key, command)?
                    .insert(field.clone(), value.clone())
                    .is_none();
                self.touch(key);
                Reply::Int(added as i64)
            }
            Command::HGet { key, field } => match self.read(key) {
                None => Reply::Nil,
                Some(Value::Hash(h)) => h.get(field).cloned().map_or(Reply::Nil, Reply::Data),
                Some(_) => return Err(wrong_type(command)),
            },
            Command::HDel { key, field } => {
                let removed = self.values.contains_key(key)
                    && self.hash_mut(key, command)?.remove(field).is_some();
                if removed {
                    self.touch(key);
                }
                Reply::Int(removed as i64)
            }
            Command::HExists { key, field } => match self.read(key) {
                None => Reply::Int(0),
                Some(Value::Hash(h)) => Reply::Int(h.contains_key(field) as i64),
                Some(_) => return Err(wrong_type(command)),
            },
            Command::HGetAll(key) => match self.read(key) {
                None => Reply::Map(HashMap::new()),
                Some(Value::Hash(h)) => Reply::Map(h.clone()),
                Some(_) => return Err(wrong_type(command)),
            },
            Command::HIncrBy { key, field, delta } => {
                let hash = self.hash_mut(key, command)?;
                let current = match hash.get(field) {
                    Some(v) => v.parse::<i64>().map_err(|_| {
                        Error::Store("ERR hash value is not an integer".to_string())
                    })?,
                    None => 0,
                };
                let next = current + delta;
                hash.insert(field.clone(), next.to_string());
                self.touch(key);
                Reply::Int(next)
            }

            Command::Publish { channel, message } => Reply::Int(shared.deliver(channel, message)),
        };
        Ok(reply)
    }
}

/// Handle to one in-process store.
///
/// Cloning shares the data. Use it as the [`Connector`] for every registry
/// that should see the same collections.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection directly, without going through [`Connector`].
    pub fn connection(&self) -> MemoryConnection {
        MemoryConnection {
            shared: self.shared.clone(),
            watched: Mutex::new(HashMap::new()),
            busy: AsyncMutex::new(()),
        }
    }

    /// Queue commands that land between WATCH and EXEC of the next
    /// transaction that watched `key`, aborting it exactly once.
    pub fn interfere(&self, key: &str, commands: Vec<Command>) {
        lock(&self.shared.data)
            .interference
            .entry(key.to_string())
            .or_default()
            .extend(commands);
    }

    /// Number of EXECs aborted because a watched key changed.
    pub fn aborted_transactions(&self) -> u64 {
        self.shared.aborted.load(Ordering::SeqCst)
    }

    /// Make every operation fail as if the server were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::SeqCst);
    }

    /// Drop every key.
    pub fn flush(&self) {
        let mut data = lock(&self.shared.data);
        let keys: Vec<String> = data.values.keys().cloned().collect();
        for key in keys {
            data.values.remove(&key);
            data.touch(&key);
        }
    }
}

#[async_trait]
impl Connector for MemoryStore {
    async fn connect(&self) -> Result<Arc<dyn Store>> {
        self.shared.check_online()?;
        Ok(Arc::new(self.connection()))
    }

    async fn listen(
        &self,
    ) -> Result<(Arc<dyn PubSub>, mpsc::UnboundedReceiver<ChannelMessage>)> {
        self.shared.check_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_listener.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.listeners).insert(
            id,
            ListenerEntry {
                channels: HashSet::new(),
                patterns: BTreeMap::new(),
                sender: tx,
            },
        );
        let listener = MemoryListener {
            id,
            shared: self.shared.clone(),
        };
        Ok((Arc::new(listener), rx))
    }
}

/// One request/response connection to a [`MemoryStore`].
pub struct MemoryConnection {
    shared: Arc<Shared>,
    watched: Mutex<HashMap<String, u64>>,
    /// Held for the duration of each command.
    busy: AsyncMutex<()>,
}

#[async_trait]
impl Store for MemoryConnection {
    async fn watch(&self, keys: &[String]) -> Result<()> {
        let _busy = self.busy.lock().await;
        self.shared.check_online()?;
        let data = lock(&self.shared.data);
        let mut watched = lock(&self.watched);
        for key in keys {
            watched
                .entry(key.clone())
                .or_insert_with(|| data.version(key));
        }
        Ok(())
    }

    async fn unwatch(&self) -> Result<()> {
        let _busy = self.busy.lock().await;
        self.shared.check_online()?;
        lock(&self.watched).clear();
        Ok(())
    }

    async fn query(&self, command: Command) -> Result<Reply> {
        let _busy = self.busy.lock().await;
        self.shared.check_online()?;
        let mut data = lock(&self.shared.data);
        let reply = data.apply(&self.shared, &command);
        self.shared.wake(&mut data);
        reply
    }

    async fn exec(&self, commands: Vec<Command>) -> Result<Option<Vec<Reply>>> {
        let _busy = self.busy.lock().await;
        self.shared.check_online()?;
        let watched = std::mem::take(&mut *lock(&self.watched));
        let mut data = lock(&self.shared.data);

        for key in watched.keys() {
            if let Some(interference) = data.interference.remove(key) {
                debug!(key = %key, "Applying injected concurrent write");
                for command in &interference {
                    data.apply(&self.shared, command)?;
                }
            }
        }

        let conflicted = watched
            .iter()
            .any(|(key, version)| data.version(key) != *version);
        if conflicted {
            self.shared.aborted.fetch_add(1, Ordering::SeqCst);
            self.shared.wake(&mut data);
            return Ok(None);
        }

        let mut replies = Vec::with_capacity(commands.len());
        for command in &commands {
            match data.apply(&self.shared, command) {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    self.shared.wake(&mut data);
                    return Err(e);
                }
            }
        }
        self.shared.wake(&mut data);
        Ok(Some(replies))
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let _busy = self.busy.lock().await;
        let deadline = (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout);
        loop {
            self.shared.check_online()?;
            let notified = self.shared.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut data = lock(&self.shared.data);
                let popped = match data.values.get_mut(key) {
                    None => None,
                    Some(Value::List(list)) => list.pop_back(),
                    Some(_) => {
                        return Err(Error::Store(
                            "WRONGTYPE BRPOP against a key holding the wrong kind of value"
                                .to_string(),
                        ))
                    }
                };
                if let Some(value) = popped {
                    data.touch(key);
                    return Ok(Some(value));
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }
}

/// Pub/sub side of a [`MemoryStore`]. Dropping it closes the message receiver.
pub struct MemoryListener {
    id: u64,
    shared: Arc<Shared>,
}

impl MemoryListener {
    fn with_entry(&self, update: impl FnOnce(&mut ListenerEntry)) -> Result<()> {
        self.shared.check_online()?;
        let mut listeners = lock(&self.shared.listeners);
        match listeners.get_mut(&self.id) {
            Some(entry) => {
                update(entry);
                Ok(())
            }
            None => Err(Error::ListenerClosed),
        }
    }
}

#[async_trait]
impl PubSub for MemoryListener {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        self.with_entry(|entry| {
            entry.channels.insert(channel.to_string());
        })
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.with_entry(|entry| {
            entry.channels.remove(channel);
        })
    }

    async fn psubscribe(&self, pattern: &str) -> Result<()> {
        let compiled = glob::Pattern::new(pattern)
            .map_err(|e| Error::Store(format!("invalid pattern '{}': {}", pattern, e)))?;
        self.with_entry(|entry| {
            entry.patterns.insert(pattern.to_string(), compiled);
        })
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<()> {
        self.with_entry(|entry| {
            entry.patterns.remove(pattern);
        })
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        lock(&self.shared.listeners).remove(&self.id);
    }
}
