//! Process-wide handles built once at startup.
//!
//! Every subsystem that registers queues, publishes, or touches the callback
//! graph receives these handles explicitly.

use std::sync::Arc;

use crate::bus::{Broker, ConnectionManager, QueueConsumerCheck, QueueRegistry};
use crate::config::Config;
use crate::graph::CallbackGraph;
use crate::notify::OperationStore;
use crate::storage::Stores;

/// Shared handles for one running core.
#[derive(Clone)]
pub struct CoreContext {
    pub config: Config,
    pub registry: Arc<QueueRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub graph: Arc<CallbackGraph>,
    pub operations: Arc<dyn OperationStore>,
    pub containers: Arc<QueueConsumerCheck>,
}

impl CoreContext {
    pub fn new(config: Config, broker: Arc<dyn Broker>, stores: Stores) -> Self {
        let registry = Arc::new(QueueRegistry::new());
        let containers = Arc::new(QueueConsumerCheck::new(
            config.health.container_queues.clone(),
        ));

        let connections = Arc::new(
            ConnectionManager::new(
                broker,
                Arc::clone(&registry),
                config.messaging.retry_delay(),
            )
            .with_container_check(containers.clone(), config.health.interval()),
        );

        Self {
            graph: Arc::new(CallbackGraph::new(stores.graph)),
            operations: stores.operations,
            config,
            registry,
            connections,
            containers,
        }
    }

    /// Exchange that core queues bind to.
    pub fn exchange(&self) -> &str {
        &self.config.messaging.exchange
    }
}
