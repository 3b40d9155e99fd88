//! Key and channel naming.
//!
//! Every store key is `<role>.<subrole>:<feed>`, e.g. `feed.ids:news`. Pub/sub
//! channels follow the same convention (`feed.publish:news`, `job.finish:render`).
//! Message bodies that carry an id and a payload join them with a single NUL
//! byte; parsing splits on the first NUL only, so payloads may contain NULs.

use std::fmt;

/// Set of every known feed name.
pub const FEEDS: &str = "feeds";
/// Broadcast channel for feed creation (`name \0 instance`).
pub const NEW_FEED: &str = "newfeed";
/// Broadcast channel for feed deletion (`name \0 instance`).
pub const DEL_FEED: &str = "delfeed";
/// Broadcast channel for configuration changes (`name \0 instance`).
pub const CONF_FEED: &str = "conffeed";

/// Separator between id and payload inside a message body.
pub const SEPARATOR: char = '\x00';

/// Ordering structure: sorted set (feed), list (sorted feed, queue, job).
pub fn ids(feed: &str) -> String {
    format!("feed.ids:{}", feed)
}

/// Item payloads keyed by id.
pub fn items(feed: &str) -> String {
    format!("feed.items:{}", feed)
}

/// JSON configuration record.
pub fn config(feed: &str) -> String {
    format!("feed.config:{}", feed)
}

/// Jobs eligible for dispatch, scored by publish time.
pub fn published(feed: &str) -> String {
    format!("feed.published:{}", feed)
}

/// Claimed jobs, scored by claim time.
pub fn claimed(feed: &str) -> String {
    format!("feed.claimed:{}", feed)
}

/// Cancellation counts keyed by job id.
pub fn cancelled(feed: &str) -> String {
    format!("feed.cancelled:{}", feed)
}

/// Stalled job ids.
pub fn stalled(feed: &str) -> String {
    format!("feed.stalled:{}", feed)
}

/// Publish counter.
pub fn publishes(feed: &str) -> String {
    format!("feed.publishes:{}", feed)
}

/// Finish counter.
pub fn finishes(feed: &str) -> String {
    format!("feed.finishes:{}", feed)
}

/// Sorted feed id generator.
pub fn idincr(feed: &str) -> String {
    format!("feed.idincr:{}", feed)
}

/// Every persistent key a feed of any type may own.
pub fn all(feed: &str) -> Vec<String> {
    vec![
        ids(feed),
        items(feed),
        config(feed),
        published(feed),
        claimed(feed),
        cancelled(feed),
        stalled(feed),
        publishes(feed),
        finishes(feed),
        idincr(feed),
    ]
}

/// Kind of notification published on a feed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Publish,
    Edit,
    Retract,
    Position,
    Finish,
}

impl EventKind {
    /// Kinds every feed type can emit.
    pub const FEED: [EventKind; 4] = [
        EventKind::Publish,
        EventKind::Edit,
        EventKind::Retract,
        EventKind::Position,
    ];

    /// Channel prefix, up to and including the colon.
    pub fn prefix(self) -> &'static str {
        match self {
            EventKind::Publish => "feed.publish:",
            EventKind::Edit => "feed.edit:",
            EventKind::Retract => "feed.retract:",
            EventKind::Position => "feed.position:",
            EventKind::Finish => "job.finish:",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "feed.publish" => Some(EventKind::Publish),
            "feed.edit" => Some(EventKind::Edit),
            "feed.retract" => Some(EventKind::Retract),
            "feed.position" => Some(EventKind::Position),
            "job.finish" => Some(EventKind::Finish),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = self.prefix();
        f.write_str(&prefix[..prefix.len() - 1])
    }
}

/// Channel for one kind of notification on one feed.
///
/// Also used with a glob in place of the feed name to build pattern channels.
pub fn channel(kind: EventKind, feed: &str) -> String {
    format!("{}{}", kind.prefix(), feed)
}

/// Split a concrete channel name into its event kind and feed name.
///
/// The feed name is everything after the first colon, so feed names may
/// themselves contain colons.
pub fn parse_channel(channel: &str) -> Option<(EventKind, &str)> {
    let (prefix, feed) = channel.split_once(':')?;
    let kind = EventKind::from_prefix(prefix)?;
    Some((kind, feed))
}

/// Join an id and a payload into a message body.
pub fn join(id: &str, payload: &str) -> String {
    let mut body = String::with_capacity(id.len() + payload.len() + 1);
    body.push_str(id);
    body.push(SEPARATOR);
    body.push_str(payload);
    body
}

/// Split a message body on its first NUL.
///
/// Bodies without a separator (retractions) yield `(id, None)`.
pub fn split(body: &str) -> (&str, Option<&str>) {
    match body.split_once(SEPARATOR) {
        Some((id, payload)) => (id, Some(payload)),
        None => (body, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(ids("news"), "feed.ids:news");
        assert_eq!(items("news"), "feed.items:news");
        assert_eq!(config("news"), "feed.config:news");
        assert_eq!(claimed("jobs"), "feed.claimed:jobs");
        assert_eq!(idincr("sorted"), "feed.idincr:sorted");
        assert_eq!(all("x").len(), 10);
    }

    #[test]
    fn test_channel_round_trip() {
        let channel = channel(EventKind::Position, "news");
        assert_eq!(channel, "feed.position:news");
        assert_eq!(parse_channel(&channel), Some((EventKind::Position, "news")));
        assert_eq!(
            parse_channel("job.finish:render"),
            Some((EventKind::Finish, "render"))
        );
    }

    #[test]
    fn test_parse_channel_keeps_colons_in_feed_name() {
        assert_eq!(
            parse_channel("feed.publish:tenant:news"),
            Some((EventKind::Publish, "tenant:news"))
        );
    }

    #[test]
    fn test_parse_channel_rejects_unknown() {
        assert_eq!(parse_channel("newfeed"), None);
        assert_eq!(parse_channel("feed.ids:news"), None);
    }

    #[test]
    fn test_split_on_first_nul_only() {
        let body = join("42", "a\x00b");
        assert_eq!(split(&body), ("42", Some("a\x00b")));
        assert_eq!(split("42"), ("42", None));
        assert_eq!(split(&join("7", "")), ("7", Some("")));
    }

    #[test]
    fn test_event_kind_display() {
        assert_eq!(EventKind::Retract.to_string(), "feed.retract");
        assert_eq!(EventKind::Finish.to_string(), "job.finish");
    }
}
