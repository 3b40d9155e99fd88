//! Optimistic read-modify-write transactions.
//!
//! Every mutation follows the same cycle under the process-local
//! [`SerialLock`]:
//!
//! 1. WATCH the keys the decision depends on
//! 2. read current state
//! 3. build the writes from that state
//! 4. EXEC them atomically
//! 5. if a watched key changed in between, EXEC applies nothing; start over
//!
//! A failed read (a guard such as "item must exist") UNWATCHes before the
//! error is returned so the next transaction on the connection starts clean.
//! The same happens when the read decides there is nothing to write.

mod lock;


pub use lock::{SerialGuard, SerialLock, DEFAULT_STALL_THRESHOLD};

use std::sync::Arc;

use async_trait::async_trait;
use backon::BackoffBuilder;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::interfaces::{Command, Reply, Store, StoreExt};
use crate::utils::retry::contention_backoff;

/// One optimistic read-modify-write operation.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// What `read` learned, handed to `write` and `commit`.
    type State: Send;
    type Output: Send;

    /// Operation name for logs and lock diagnostics.
    fn name(&self) -> &'static str;

    fn watched(&self) -> Vec<String>;

    /// Read current state. An error here aborts the operation.
    async fn read(&self, store: &dyn Store) -> Result<Self::State>;

    fn write(&self, state: &Self::State) -> Vec<Command>;

    /// Interpret the committed replies, one per command from `write`.
    fn commit(&self, state: Self::State, replies: Vec<Reply>) -> Result<Self::Output>;
}

/// Runs transactions against one connection.
#[derive(Clone)]
pub struct Runner {
    store: Arc<dyn Store>,
    lock: SerialLock,
    retry: RetryConfig,
}

impl Runner {
    pub fn new(store: Arc<dyn Store>, lock: SerialLock, retry: RetryConfig) -> Self {
        Self { store, lock, retry }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn lock(&self) -> &SerialLock {
        &self.lock
    }

    /// Acquire the lock and run `tx` until it commits or fails.
    pub async fn run<T: Transaction>(&self, tx: &T) -> Result<T::Output> {
        let _guard = self.lock.acquire(tx.name()).await;
        self.run_locked(tx).await
    }

    /// Run `tx` while the caller already holds the lock.
    pub async fn run_locked<T: Transaction>(&self, tx: &T) -> Result<T::Output> {
        let mut backoff = contention_backoff(&self.retry).build();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            self.store.watch(&tx.watched()).await?;

            let state = match tx.read(self.store.as_ref()).await {
                Ok(state) => state,
                Err(e) => {
                    if let Err(unwatch) = self.store.unwatch().await {
                        warn!(operation = tx.name(), error = %unwatch, "UNWATCH failed after aborted read");
                    }
                    return Err(e);
                }
            };

            let commands = tx.write(&state);
            if commands.is_empty() {
                self.store.unwatch().await?;
                return tx.commit(state, Vec::new());
            }
            match self.store.exec(commands).await? {
                Some(replies) => {
                    debug!(operation = tx.name(), attempts, "Transaction committed");
                    return tx.commit(state, replies);
                }
                None => match backoff.next() {
                    Some(delay) => {
                        debug!(
                            operation = tx.name(),
                            attempts,
                            delay_ms = delay.as_millis() as u64,
                            "Watched key changed, retrying"
                        );
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    None => {
                        warn!(operation = tx.name(), attempts, "Giving up on contended transaction");
                        return Err(Error::ContentionExhausted { attempts });
                    }
                },
            }
        }
    }

    /// Run commands atomically without watching anything.
    ///
    /// Used where correctness comes from the lock and the atomicity of the
    /// batch alone.
    pub async fn exec_locked(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        self.store
            .exec(commands)
            .await?
            .ok_or_else(|| Error::UnexpectedReply {
                command: "EXEC",
                reply: "aborted without watched keys".to_string(),
            })
    }
}

/// Precondition checked by a [`Guarded`] transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    /// `member` has a score in sorted set `key`.
    SortedMember { key: String, member: String },
    /// Hash `key` has `field`.
    HashField { key: String, field: String },
    /// Set `key` contains `member`.
    SetMember { key: String, member: String },
}

impl Probe {
    pub async fn holds(&self, store: &dyn Store) -> Result<bool> {
        match self {
            Probe::SortedMember { key, member } => Ok(store.zscore(key, member).await?.is_some()),
            Probe::HashField { key, field } => store.hexists(key, field).await,
            Probe::SetMember { key, member } => store.sismember(key, member).await,
        }
    }

    fn key(&self) -> &str {
        match self {
            Probe::SortedMember { key, .. }
            | Probe::HashField { key, .. }
            | Probe::SetMember { key, .. } => key,
        }
    }
}

type ErrorFn = Box<dyn Fn() -> Error + Send + Sync>;

/// Fixed writes applied only while a membership precondition holds.
///
/// The probed key is always watched, so the precondition cannot change
/// between the check and the commit.
pub struct Guarded {
    name: &'static str,
    probe: Probe,
    also_watch: Vec<String>,
    commands: Vec<Command>,
    failed: ErrorFn,
}

impl Guarded {
    pub fn new(
        name: &'static str,
        probe: Probe,
        commands: Vec<Command>,
        failed: impl Fn() -> Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            probe,
            also_watch: Vec::new(),
            commands,
            failed: Box::new(failed),
        }
    }

    /// Watch additional keys alongside the probed one.
    pub fn watching(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.also_watch.extend(keys);
        self
    }
}

#[async_trait]
impl Transaction for Guarded {
    type State = ();
    type Output = Vec<Reply>;

    fn name(&self) -> &'static str {
        self.name
    }

    fn watched(&self) -> Vec<String> {
        let mut keys = vec![self.probe.key().to_string()];
        keys.extend(self.also_watch.iter().cloned());
        keys
    }

    async fn read(&self, store: &dyn Store) -> Result<()> {
        if self.probe.holds(store).await? {
            Ok(())
        } else {
            Err((self.failed)())
        }
    }

    fn write(&self, _state: &()) -> Vec<Command> {
        self.commands.clone()
    }

    fn commit(&self, _state: (), replies: Vec<Reply>) -> Result<Vec<Reply>> {
        Ok(replies)
    }
}
