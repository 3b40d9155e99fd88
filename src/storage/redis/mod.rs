//! Redis store implementation.

mod pubsub;
mod store;

pub use pubsub::RedisPubSub;
pub use store::RedisStore;

use std::sync::Arc;

use async_trait::async_trait;
use redis::Client;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::Result;
use crate::interfaces::{ChannelMessage, Connector, PubSub, Store};

/// Opens Redis connections for one URL.
///
/// The database is selected by the URL path (`redis://host:6379/2`).
#[derive(Clone)]
pub struct RedisConnector {
    client: Client,
    url: String,
}

impl RedisConnector {
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn Store>> {
        let store = RedisStore::connect(self.client.clone()).await?;
        info!(url = %self.url, "Connected to Redis");
        Ok(Arc::new(store))
    }

    async fn listen(
        &self,
    ) -> Result<(Arc<dyn PubSub>, mpsc::UnboundedReceiver<ChannelMessage>)> {
        let (pubsub, messages) = RedisPubSub::connect(&self.client).await?;
        info!(url = %self.url, "Connected to Redis pub/sub");
        Ok((Arc::new(pubsub), messages))
    }
}
