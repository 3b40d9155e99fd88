//! Typed feed events and cross-process registry notices.

use tracing::warn;

use super::position::Position;
use crate::keys::{self, EventKind};

/// A change to one feed, as announced on its pub/sub channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Publish {
        feed: String,
        id: String,
        item: String,
    },
    Edit {
        feed: String,
        id: String,
        item: String,
    },
    Retract {
        feed: String,
        id: String,
    },
    Position {
        feed: String,
        id: String,
        position: Position,
    },
    /// A job finished with a result.
    Finish {
        feed: String,
        id: String,
        result: String,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Publish { .. } => EventKind::Publish,
            Event::Edit { .. } => EventKind::Edit,
            Event::Retract { .. } => EventKind::Retract,
            Event::Position { .. } => EventKind::Position,
            Event::Finish { .. } => EventKind::Finish,
        }
    }

    pub fn feed(&self) -> &str {
        match self {
            Event::Publish { feed, .. }
            | Event::Edit { feed, .. }
            | Event::Retract { feed, .. }
            | Event::Position { feed, .. }
            | Event::Finish { feed, .. } => feed,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Event::Publish { id, .. }
            | Event::Edit { id, .. }
            | Event::Retract { id, .. }
            | Event::Position { id, .. }
            | Event::Finish { id, .. } => id,
        }
    }

    /// Decode a message from a feed channel.
    ///
    /// Returns `None` for channels outside the feed naming convention and
    /// for malformed bodies.
    pub fn parse(channel: &str, body: &str) -> Option<Event> {
        let (kind, feed) = keys::parse_channel(channel)?;
        let feed = feed.to_string();
        let (id, payload) = keys::split(body);
        let id = id.to_string();

        let event = match kind {
            EventKind::Retract => Event::Retract { feed, id },
            EventKind::Publish => Event::Publish {
                feed,
                id,
                item: payload?.to_string(),
            },
            EventKind::Edit => Event::Edit {
                feed,
                id,
                item: payload?.to_string(),
            },
            EventKind::Finish => Event::Finish {
                feed,
                id,
                result: payload.unwrap_or_default().to_string(),
            },
            EventKind::Position => match payload?.parse() {
                Ok(position) => Event::Position { feed, id, position },
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Dropping position event");
                    return None;
                }
            },
        };
        Some(event)
    }

    /// Encode as (channel, body) for publishing.
    pub fn encode(&self) -> (String, String) {
        let channel = keys::channel(self.kind(), self.feed());
        let body = match self {
            Event::Retract { id, .. } => id.clone(),
            Event::Publish { id, item, .. } | Event::Edit { id, item, .. } => keys::join(id, item),
            Event::Position { id, position, .. } => keys::join(id, &position.to_string()),
            Event::Finish { id, result, .. } => keys::join(id, result),
        };
        (channel, body)
    }
}

/// What happened to a feed in another (or this) process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Created,
    Deleted,
    Configured,
}

impl NoticeKind {
    pub const CHANNELS: [&'static str; 3] = [keys::NEW_FEED, keys::DEL_FEED, keys::CONF_FEED];

    pub fn channel(self) -> &'static str {
        match self {
            NoticeKind::Created => keys::NEW_FEED,
            NoticeKind::Deleted => keys::DEL_FEED,
            NoticeKind::Configured => keys::CONF_FEED,
        }
    }

    fn from_channel(channel: &str) -> Option<Self> {
        match channel {
            keys::NEW_FEED => Some(NoticeKind::Created),
            keys::DEL_FEED => Some(NoticeKind::Deleted),
            keys::CONF_FEED => Some(NoticeKind::Configured),
            _ => None,
        }
    }
}

/// Registry-level broadcast (`name \0 instance`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemNotice {
    pub kind: NoticeKind,
    pub feed: String,
    /// Instance id of the registry that made the change.
    pub instance: String,
}

impl SystemNotice {
    pub fn parse(channel: &str, body: &str) -> Option<Self> {
        let kind = NoticeKind::from_channel(channel)?;
        let (feed, instance) = keys::split(body);
        Some(Self {
            kind,
            feed: feed.to_string(),
            instance: instance.unwrap_or_default().to_string(),
        })
    }

    pub fn body(feed: &str, instance: &str) -> String {
        keys::join(feed, instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_publish_keeps_nul_in_item() {
        let event = Event::parse("feed.publish:news", "7\x00a\x00b").unwrap();
        assert_eq!(
            event,
            Event::Publish {
                feed: "news".to_string(),
                id: "7".to_string(),
                item: "a\x00b".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_retract_bare_id() {
        let event = Event::parse("feed.retract:news", "7").unwrap();
        assert_eq!(event.kind(), EventKind::Retract);
        assert_eq!(event.id(), "7");
        assert_eq!(event.feed(), "news");
    }

    #[test]
    fn test_parse_position() {
        let event = Event::parse("feed.position:list", "3\x00begin:").unwrap();
        assert_eq!(
            event,
            Event::Position {
                feed: "list".to_string(),
                id: "3".to_string(),
                position: Position::Begin,
            }
        );
    }

    #[test]
    fn test_parse_rejects_publish_without_item() {
        assert_eq!(Event::parse("feed.publish:news", "7"), None);
        assert_eq!(Event::parse("newfeed", "news\x00abc"), None);
    }

    #[test]
    fn test_encode_matches_wire_format() {
        let event = Event::Finish {
            feed: "render".to_string(),
            id: "j1".to_string(),
            result: "done".to_string(),
        };
        assert_eq!(
            event.encode(),
            ("job.finish:render".to_string(), "j1\x00done".to_string())
        );

        let (channel, body) = Event::Position {
            feed: "list".to_string(),
            id: "3".to_string(),
            position: Position::After("2".to_string()),
        }
        .encode();
        assert_eq!(Event::parse(&channel, &body).map(|e| e.id().to_string()), Some("3".to_string()));
    }

    #[test]
    fn test_system_notice() {
        let notice = SystemNotice::parse("conffeed", &SystemNotice::body("news", "inst-1")).unwrap();
        assert_eq!(notice.kind, NoticeKind::Configured);
        assert_eq!(notice.feed, "news");
        assert_eq!(notice.instance, "inst-1");
        assert_eq!(SystemNotice::parse("feed.publish:x", "a"), None);
    }
}
