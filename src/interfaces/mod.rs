//! Abstract interfaces for the backing store.
//!
//! These traits define the contracts for:
//! - Request/response access with optimistic transactions (`Store`)
//! - Pub/sub listening (`PubSub`)
//! - Opening independent connections (`Connector`)

pub mod command;
pub mod pubsub;
pub mod store;

pub use command::{Command, Reply, ReplyKind};
pub use pubsub::{ChannelMessage, PubSub};
pub use store::{Connector, Store, StoreExt};
