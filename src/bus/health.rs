//! Container liveness polling.
//!
//! Worker containers announce themselves by consuming their own queue. A
//! container is considered online while the broker reports at least one
//! consumer on that queue.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::BrokerConnection;

/// Periodic check run by the connection manager's health task.
#[async_trait]
pub trait ContainerCheck: Send + Sync {
    async fn check(&self, connection: &dyn BrokerConnection);
}

/// Last observed state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Online,
    Offline,
    /// The broker could not answer for this queue.
    Unknown,
}

/// Tracks container queues by their consumer count.
pub struct QueueConsumerCheck {
    queues: Vec<String>,
    status: RwLock<HashMap<String, ContainerStatus>>,
}

impl QueueConsumerCheck {
    pub fn new(queues: Vec<String>) -> Self {
        Self {
            queues,
            status: RwLock::new(HashMap::new()),
        }
    }

    /// Status from the most recent poll, or `None` if never polled.
    pub async fn status(&self, queue: &str) -> Option<ContainerStatus> {
        self.status.read().await.get(queue).copied()
    }

    pub async fn online(&self) -> Vec<String> {
        let status = self.status.read().await;
        self.queues
            .iter()
            .filter(|q| status.get(q.as_str()) == Some(&ContainerStatus::Online))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ContainerCheck for QueueConsumerCheck {
    async fn check(&self, connection: &dyn BrokerConnection) {
        for queue in &self.queues {
            let current = match connection.consumer_count(queue).await {
                Ok(0) => ContainerStatus::Offline,
                Ok(_) => ContainerStatus::Online,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Failed to query container queue");
                    ContainerStatus::Unknown
                }
            };

            let previous = self.status.write().await.insert(queue.clone(), current);
            if previous == Some(current) {
                continue;
            }

            match current {
                ContainerStatus::Online => info!(queue = %queue, "Container online"),
                ContainerStatus::Offline if previous.is_some() => {
                    warn!(queue = %queue, "Container went offline")
                }
                ContainerStatus::Offline => info!(queue = %queue, "Container offline"),
                ContainerStatus::Unknown => {}
            }
        }
    }
}
