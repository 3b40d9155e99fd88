//! Per-feed configuration persisted in the store.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Kind of collection stored under a feed name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedType {
    #[default]
    Feed,
    SortedFeed,
    Queue,
    Job,
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedType::Feed => write!(f, "feed"),
            FeedType::SortedFeed => write!(f, "sorted_feed"),
            FeedType::Queue => write!(f, "queue"),
            FeedType::Job => write!(f, "job"),
        }
    }
}

/// JSON record stored at `feed.config:<name>`.
///
/// Writes replace the whole record. Keys this crate does not know about are
/// kept so that other clients' settings survive a round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(rename = "type", default)]
    pub feed_type: FeedType,
    /// Feeds only: keep at most this many items, evicting the oldest.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_length"
    )]
    pub max_length: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl FeedConfig {
    pub fn new(feed_type: FeedType) -> Self {
        Self {
            feed_type,
            ..Self::default()
        }
    }

    pub fn with_max_length(mut self, max_length: u64) -> Self {
        self.max_length = (max_length > 0).then_some(max_length);
        self
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Accept `5`, `"5"`, `null` or `""`; zero means unbounded.
fn lenient_length<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let length = match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Number(n)) => Some(
            n.as_u64()
                .ok_or_else(|| D::Error::custom(format!("invalid max_length {}", n)))?,
        ),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => None,
        Some(serde_json::Value::String(s)) => Some(
            s.trim()
                .parse::<u64>()
                .map_err(|_| D::Error::custom(format!("invalid max_length '{}'", s)))?,
        ),
        Some(other) => {
            return Err(D::Error::custom(format!("invalid max_length {}", other)));
        }
    };
    Ok(length.filter(|n| *n > 0))
}
