//! Store configuration types.

use std::fmt;

use serde::Deserialize;

/// Store type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    #[default]
    Redis,
    Memory,
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreType::Redis => write!(f, "redis"),
            StoreType::Memory => write!(f, "memory"),
        }
    }
}

/// Store configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store type discriminator.
    #[serde(rename = "type")]
    pub store_type: StoreType,
    /// Redis-specific configuration.
    pub redis: RedisConfig,
}

/// Redis-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL; the path selects the database.
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_type_deserialize_lowercase() {
        let parsed: StoreConfig = serde_json::from_str(r#"{"type":"memory"}"#).unwrap();
        assert_eq!(parsed.store_type, StoreType::Memory);
        assert_eq!(parsed.redis.url, RedisConfig::default().url);
        assert_eq!(StoreType::Redis.to_string(), "redis");
    }
}
