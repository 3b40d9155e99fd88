//! Thoonk - persistent push feeds over a shared key-value/pub-sub store
//!
//! Feeds, sorted feeds, queues and job queues whose state lives in the store
//! (Redis, or the in-process store for tests) so that any number of processes
//! see the same collections. Every mutation runs as an optimistic
//! WATCH/MULTI/EXEC transaction, serialized per process, and announces itself
//! on pub/sub channels that are fanned out to typed local subscriptions.
//!
//! ```no_run
//! # async fn demo() -> thoonk::Result<()> {
//! use std::time::Duration;
//! use thoonk::{Config, Registry};
//!
//! let thoonk = Registry::connect(&Config::default()).await?;
//! let jobs = thoonk.job("render", None).await?;
//! let id = jobs.publish("frame-1", None, false).await?;
//! if let Some(job) = jobs.get(Duration::from_secs(1)).await? {
//!     jobs.finish(&job.id, Some("ok")).await?;
//! }
//! # let _ = id;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod collections;
pub mod config;
pub mod error;
pub mod interfaces;
pub mod keys;
pub mod registry;
pub mod storage;
pub mod transaction;
pub mod utils;

pub use bus::{Event, EventKind, Position, Subscription};
pub use collections::{Collection, Feed, Job, JobItem, Placement, Queue, ResultWaiter, SortedFeed};
pub use config::Config;
pub use error::{Error, Result};
pub use registry::{FeedConfig, FeedType, Registry, RegistryEvent};
