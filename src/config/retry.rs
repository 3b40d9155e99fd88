//! Optimistic transaction retry policy.

use serde::Deserialize;

/// How aborted transactions are retried.
///
/// Aborts are retried until the transaction commits unless `max_attempts`
/// is set, in which case the operation fails with
/// [`crate::Error::ContentionExhausted`] once the attempts are used up.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first; `None` for no limit.
    pub max_attempts: Option<u32>,
    /// First retry delay.
    pub min_delay_ms: u64,
    /// Delay cap.
    pub max_delay_ms: u64,
    /// Randomize delays so contending processes drift apart.
    pub jitter: bool,
    /// Warn when a transaction waits on or holds the serial lock this long.
    pub lock_stall_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            min_delay_ms: 1,
            max_delay_ms: 100,
            jitter: true,
            lock_stall_ms: 5_000,
        }
    }
}
