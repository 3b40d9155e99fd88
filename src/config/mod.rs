//! Application configuration.
//!
//! Aggregates store, retry and fanout settings into a single Config struct
//! that can be loaded from YAML files or environment variables.
//!
//! Per-feed settings (`type`, `max_length`) are not part of this; they are
//! persisted in the store next to each feed, see [`crate::registry::FeedConfig`].

mod fanout;
mod retry;
mod store;

pub use fanout::FanoutConfig;
pub use retry::RetryConfig;
pub use store::{RedisConfig, StoreConfig, StoreType};

use serde::Deserialize;

use crate::error::Result;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "thoonk.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "THOONK_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "THOONK";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "THOONK_LOG";

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backing store.
    pub store: StoreConfig,
    /// Optimistic transaction retry policy.
    pub retry: RetryConfig,
    /// Event fanout tuning.
    pub fanout: FanoutConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `thoonk.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    ///    (`THOONK__STORE__REDIS__URL`)
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// In-process store, default retry policy.
    pub fn for_test() -> Self {
        Self {
            store: StoreConfig {
                store_type: StoreType::Memory,
                ..StoreConfig::default()
            },
            ..Self::default()
        }
    }
}
