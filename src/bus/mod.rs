//! Event fanout.
//!
//! Turns raw pub/sub traffic from the listener connection into typed
//! [`Event`]s delivered to local [`Subscription`]s:
//! - One store-level subscription per channel or pattern, shared by every
//!   local listener and reference counted
//! - Subscribe calls resolve only after the store acknowledges them
//! - Registry notices (`newfeed`/`delfeed`/`conffeed`) are split off for the
//!   registry's own cache maintenance

mod event;
mod fanout;
mod position;


pub use crate::keys::EventKind;
pub use event::{Event, NoticeKind, SystemNotice};
pub use fanout::{EventFanout, Subscription, Target};
pub use position::{InvalidPosition, Position};
