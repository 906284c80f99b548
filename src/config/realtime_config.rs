// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Settings for the call queue and the collector.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Call queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Logical ring capacity in bytes.
    pub capacity_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 64 * 1024,
        }
    }
}

/// Collector settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Time between sweeps in milliseconds.
    pub sweep_interval_ms: u64,
    /// Sweep passes attempted at shutdown before reporting a leak.
    pub shutdown_sweep_passes: usize,
}

impl CollectorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 150,
            shutdown_sweep_passes: 100,
        }
    }
}

/// Complete real-time bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
}

impl RealtimeConfig {
    /// Load config from TOML string.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Serialize to TOML string.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = RealtimeConfig::from_toml("[queue]\ncapacity_bytes = 2048\n").unwrap();
        assert_eq!(config.queue.capacity_bytes, 2048);
        assert_eq!(config.collector, CollectorConfig::default());
        assert_eq!(config.collector.sweep_interval(), Duration::from_millis(150));

        let config = RealtimeConfig::from_toml("[collector]\nsweep_interval_ms = 50\n").unwrap();
        assert_eq!(config.collector.sweep_interval(), Duration::from_millis(50));
        assert_eq!(config.collector.shutdown_sweep_passes, 100);
        assert_eq!(config.queue, QueueConfig::default());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = RealtimeConfig::default();
        config.collector.sweep_interval_ms = 20;
        let text = config.to_toml().unwrap();
        assert_eq!(RealtimeConfig::from_toml(&text).unwrap(), config);
    }
}
