//! Error taxonomy for collection operations.
//!
//! Errors fall into four groups:
//! - Precondition violations: a state-machine guard failed, nothing was written.
//! - Contention: only surfaced when a bounded retry policy is configured.
//! - Connectivity/store failures: never retried by this crate.
//! - Configuration and lifecycle errors.

use crate::registry::FeedType;

/// Result type for collection and registry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while operating on feeds, queues and jobs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Item '{id}' does not exist in feed '{feed}'")]
    DoesNotExist { feed: String, id: String },

    #[error("Job '{id}' in '{feed}' is not claimed")]
    JobNotClaimed { feed: String, id: String },

    #[error("Job '{id}' in '{feed}' is unclaimed and cannot be cancelled")]
    IdUnclaimed { feed: String, id: String },

    #[error("Job '{id}' in '{feed}' is not claimed and cannot be stalled")]
    NotClaimed { feed: String, id: String },

    #[error("Job '{id}' in '{feed}' is not stalled")]
    IdNotStalled { feed: String, id: String },

    #[error("Job '{id}' not found in '{feed}'")]
    IdNotFound { feed: String, id: String },

    #[error("Item '{id}' in '{feed}' cannot be moved relative to itself")]
    NoChange { feed: String, id: String },

    #[error("Feed '{0}' does not exist")]
    FeedNotFound(String),

    #[error("Feed '{feed}' is a {actual}, not a {expected}")]
    TypeMismatch {
        feed: String,
        expected: FeedType,
        actual: FeedType,
    },

    #[error("Transaction gave up after {attempts} conflicting attempts")]
    ContentionExhausted { attempts: u32 },

    #[error("Store error: {0}")]
    Store(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Unexpected reply to {command}: {reply}")]
    UnexpectedReply {
        command: &'static str,
        reply: String,
    },

    #[error("Pub/sub listener connection closed")]
    ListenerClosed,

    #[error("Registry has been dropped")]
    RegistryClosed,

    #[error("Invalid feed configuration: {0}")]
    InvalidFeedConfig(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

impl Error {
    /// Whether this error is a failed state-machine guard.
    ///
    /// Precondition failures leave the store untouched and will fail the same
    /// way if repeated without an intervening state change.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::DoesNotExist { .. }
                | Error::JobNotClaimed { .. }
                | Error::IdUnclaimed { .. }
                | Error::NotClaimed { .. }
                | Error::IdNotStalled { .. }
                | Error::IdNotFound { .. }
                | Error::NoChange { .. }
                | Error::FeedNotFound(_)
                | Error::TypeMismatch { .. }
        )
    }

    /// Whether this error came from the store connection itself.
    ///
    /// These are not retried here; reconnect policy belongs to the caller.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Error::Store(_) | Error::ListenerClosed | Error::UnexpectedReply { .. } => true,
            #[cfg(feature = "redis")]
            Error::Redis(_) => true,
            _ => false,
        }
    }
}
