//! Cluster configuration.

use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration recognized by the cluster runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Number of members expected to hold a replica of each service.
    pub replication_factor: usize,
    /// How often heartbeats are emitted (in milliseconds).
    pub heartbeat_interval_ms: u64,
    /// Silence after which the master is treated as unreachable (in milliseconds).
    pub master_timeout_ms: u64,
    /// Bounded wait for each replica reply (in milliseconds).
    pub request_timeout_ms: u64,
    /// Capacity of the cluster event channel.
    pub event_capacity: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            heartbeat_interval_ms: 1000,
            master_timeout_ms: 5000,
            request_timeout_ms: 2000,
            event_capacity: 100,
        }
    }
}

impl ClusterConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn master_timeout(&self) -> Duration {
        Duration::from_millis(self.master_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Check the invariants the runtime relies on.
    pub fn validate(&self) -> Result<()> {
        if self.replication_factor == 0 {
            return Err(ClusterError::InvalidConfig(
                "replication_factor must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ClusterError::InvalidConfig(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.master_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ClusterError::InvalidConfig(format!(
                "master_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.master_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(ClusterError::InvalidConfig(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ClusterError::InvalidConfig(
                "event_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Load a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ClusterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Builder for cluster configuration.
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClusterConfig::default(),
        }
    }

    pub fn replication_factor(mut self, factor: usize) -> Self {
        self.config.replication_factor = factor;
        self
    }

    pub fn heartbeat_interval(mut self, ms: u64) -> Self {
        self.config.heartbeat_interval_ms = ms;
        self
    }

    pub fn master_timeout(mut self, ms: u64) -> Self {
        self.config.master_timeout_ms = ms;
        self
    }

    pub fn request_timeout(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<ClusterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ClusterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
