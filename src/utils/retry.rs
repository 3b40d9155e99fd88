//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter. Provides the backoff
//! between optimistic transaction attempts and the one used while opening
//! store connections.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::config::RetryConfig;

/// Backoff between attempts of an aborted optimistic transaction.
///
/// Unbounded unless `max_attempts` is set; the first attempt is not counted
/// as a retry, so `max_attempts = 3` allows two retries.
pub fn contention_backoff(config: &RetryConfig) -> ExponentialBuilder {
    let retries = match config.max_attempts {
        Some(attempts) => attempts.saturating_sub(1) as usize,
        None => usize::MAX,
    };
    let builder = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.min_delay_ms))
        .with_max_delay(Duration::from_millis(config.max_delay_ms))
        .with_max_times(retries);
    if config.jitter {
        builder.with_jitter()
    } else {
        builder
    }
}

/// Backoff for store connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}
