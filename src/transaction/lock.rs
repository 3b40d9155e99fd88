//! Process-local serialization of store transactions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

/// Default time after which a waiting or holding operation is reported.
pub const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_secs(5);

/// FIFO mutex ordering this process's transactions.
///
/// Waiters are served in arrival order. Holding the returned guard is the
/// only way to be "in flight"; dropping it on any exit path releases the
/// next waiter.
#[derive(Clone)]
pub struct SerialLock {
    mutex: Arc<Mutex<()>>,
    waiting: Arc<AtomicUsize>,
    stall_threshold: Duration,
}

/// Held while a transaction is in flight.
pub struct SerialGuard {
    _guard: OwnedMutexGuard<()>,
    acquired: Instant,
    operation: &'static str,
    stall_threshold: Duration,
}

struct Waiting<'a>(&'a AtomicUsize);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for SerialLock {
    fn default() -> Self {
        Self::new(DEFAULT_STALL_THRESHOLD)
    }
}

impl SerialLock {
    pub fn new(stall_threshold: Duration) -> Self {
        Self {
            mutex: Arc::new(Mutex::new(())),
            waiting: Arc::new(AtomicUsize::new(0)),
            stall_threshold,
        }
    }

    /// Wait for every earlier operation to finish.
    ///
    /// Logs a warning each time the wait exceeds the stall threshold, which
    /// points at a guard kept alive across unrelated work.
    pub async fn acquire(&self, operation: &'static str) -> SerialGuard {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = Waiting(&self.waiting);

        let started = Instant::now();
        let acquire = self.mutex.clone().lock_owned();
        tokio::pin!(acquire);

        let guard = loop {
            match tokio::time::timeout(self.stall_threshold, &mut acquire).await {
                Ok(guard) => break guard,
                Err(_) => warn!(
                    operation,
                    waited_ms = started.elapsed().as_millis() as u64,
                    waiting = self.waiting.load(Ordering::SeqCst),
                    "Serial lock acquisition stalled"
                ),
            }
        };

        SerialGuard {
            _guard: guard,
            acquired: Instant::now(),
            operation,
            stall_threshold: self.stall_threshold,
        }
    }

    /// Operations waiting to acquire, not counting the holder.
    pub fn pending(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn is_locked(&self) -> bool {
        self.mutex.try_lock().is_err()
    }
}

impl Drop for SerialGuard {
    fn drop(&mut self) {
        let held = self.acquired.elapsed();
        if held > self.stall_threshold {
            warn!(
                operation = self.operation,
                held_ms = held.as_millis() as u64,
                "Serial lock held past stall threshold"
            );
        }
    }
}
