//! Bootstrap utilities.
//!
//! Tracing setup and connection retry for processes embedding the crate.

use std::future::Future;

use backon::BackoffBuilder;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;
use crate::utils::retry::connection_backoff;

/// Initialize tracing with the THOONK_LOG environment variable.
///
/// Defaults to "info" level if THOONK_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect to the store with exponential backoff retry.
///
/// # Arguments
/// * `what` - Human-readable name for logging (e.g., "primary", "listener")
/// * `address` - Where the store lives, for logging
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connection on success, or the last error once the backoff runs out.
pub async fn connect_with_retry<T, E, F, Fut>(what: &str, address: &str, connect: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = connection_backoff().build();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match connect().await {
            Ok(conn) => {
                tracing::info!("Connected {} to {}", what, address);
                return Ok(conn);
            }
            Err(e) => match backoff.next() {
                Some(delay) => {
                    warn!(
                        "Failed to connect {} to {} (attempt {}): {}. Retrying in {:?}...",
                        what, address, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!(
                        "Failed to connect {} to {} after {} attempts: {}",
                        what,
                        address,
                        attempt,
                        e
                    );
                    return Err(e);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_connect_with_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = connect_with_retry("primary", "memory", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("refused {}", n))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
