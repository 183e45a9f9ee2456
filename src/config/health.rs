//! Container health polling configuration.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between container checks.
    pub interval_secs: u64,
    /// Queues whose consumer presence marks a container as online.
    pub container_queues: Vec<String>,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            container_queues: Vec::new(),
        }
    }
}
