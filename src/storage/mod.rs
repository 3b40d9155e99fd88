//! Store implementations.

use std::sync::Arc;

use tracing::info;

use crate::config::{StoreConfig, StoreType};
use crate::error::Result;
use crate::interfaces::Connector;

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::{MemoryConnection, MemoryStore};

#[cfg(feature = "redis")]
pub use self::redis::{RedisConnector, RedisStore};

/// Build a connector based on configuration.
pub fn init_connector(config: &StoreConfig) -> Result<Arc<dyn Connector>> {
    match config.store_type {
        StoreType::Memory => {
            info!("Store: in-process memory");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "redis")]
        StoreType::Redis => {
            info!(url = %config.redis.url, "Store: redis");
            Ok(Arc::new(RedisConnector::new(&config.redis.url)?))
        }
        #[cfg(not(feature = "redis"))]
        StoreType::Redis => {
            tracing::error!("Redis store requested but 'redis' feature is not enabled");
            Err(crate::error::Error::Store("redis feature not enabled".to_string()))
        }
    }
}
