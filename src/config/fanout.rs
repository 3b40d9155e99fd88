//! Event fanout configuration.

use serde::Deserialize;

/// Event fanout tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Warn once a single channel or pattern has more local listeners than this.
    pub listener_warn_threshold: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            listener_warn_threshold: 100,
        }
    }
}
