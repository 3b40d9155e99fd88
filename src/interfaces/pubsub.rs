//! Pub/sub listener interface.

use async_trait::async_trait;

use crate::error::Result;

/// A message delivered on a subscribed channel or pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    /// Concrete channel the message was published on.
    pub channel: String,
    pub payload: String,
}

/// Subscription control for a listener connection.
///
/// Each call resolves once the store has acknowledged it, so a message
/// published after `subscribe` returns is guaranteed to be delivered.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<()>;

    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    async fn psubscribe(&self, pattern: &str) -> Result<()>;

    async fn punsubscribe(&self, pattern: &str) -> Result<()>;
}
