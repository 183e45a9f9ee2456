//! P2P link event handler.
//!
//! Agents report new and torn-down peer links through a direct queue. Each
//! event is forwarded to the callback graph; lookup misses and storage
//! failures are logged there and never reject the delivery.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::{self, BusError, Delivery, DirectHandler, DirectQueue, QueueBinding};
use crate::graph::{CallbackGraph, EdgeChange};

/// Queue and routing key for P2P link events.
pub const P2P_LINK_QUEUE: &str = "p2p_link_events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkAction {
    Add,
    Remove,
}

/// A link change reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct P2pLinkEvent {
    pub action: LinkAction,
    /// Agent callback UUID of the reporting side.
    pub source: String,
    pub destination: String,
    pub c2_profile: String,
}

impl P2pLinkEvent {
    fn validate(&self) -> bus::Result<()> {
        for id in [&self.source, &self.destination] {
            Uuid::parse_str(id)
                .map_err(|e| BusError::Handler(format!("invalid agent id '{}': {}", id, e)))?;
        }
        if self.c2_profile.is_empty() {
            return Err(BusError::Handler("empty c2_profile".to_string()));
        }
        Ok(())
    }
}

/// Forwards P2P link events to the callback graph.
pub struct P2pLinkHandler {
    graph: Arc<CallbackGraph>,
}

impl P2pLinkHandler {
    pub fn new(graph: Arc<CallbackGraph>) -> Self {
        Self { graph }
    }

    /// Direct queue registration for this handler.
    pub fn queue(graph: Arc<CallbackGraph>, exchange: &str) -> DirectQueue {
        DirectQueue::new(
            QueueBinding::new(exchange, P2P_LINK_QUEUE, P2P_LINK_QUEUE),
            Arc::new(Self::new(graph)),
        )
    }

    async fn apply(graph: &CallbackGraph, event: &P2pLinkEvent) -> EdgeChange {
        match event.action {
            LinkAction::Add => {
                graph
                    .link_by_agent_id(&event.source, &event.destination, &event.c2_profile)
                    .await
            }
            LinkAction::Remove => {
                graph
                    .unlink_by_agent_id(&event.source, &event.destination, &event.c2_profile)
                    .await
            }
        }
    }
}

impl DirectHandler for P2pLinkHandler {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, bus::Result<()>> {
        let graph = Arc::clone(&self.graph);

        async move {
            let event: P2pLinkEvent = delivery.decode()?;
            event.validate()?;

            let change = Self::apply(&graph, &event).await;
            match change {
                EdgeChange::Linked | EdgeChange::Unlinked => info!(
                    action = ?event.action,
                    source = %event.source,
                    destination = %event.destination,
                    profile = %event.c2_profile,
                    "P2P link updated"
                ),
                _ => debug!(action = ?event.action, outcome = ?change, "P2P link event had no effect"),
            }
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockGraphStore;

    const A: &str = "0b6e7c9c-1a43-4c7e-9d36-5a0a4a1f0c11";
    const B: &str = "5f2d2b1e-8e0a-4f51-a4b7-2c9b3e8d7a22";

    async fn graph() -> (Arc<MockGraphStore>, Arc<CallbackGraph>) {
        let store = Arc::new(MockGraphStore::new());
        store.add_callback(1, A, 1, 1).await;
        store.add_callback(2, B, 1, 2).await;
        store.add_profile(3, "smb").await;
        let graph = Arc::new(CallbackGraph::new(store.clone()));
        (store, graph)
    }

    fn delivery(action: &str, source: &str, destination: &str) -> Delivery {
        Delivery::json(
            P2P_LINK_QUEUE,
            &serde_json::json!({
                "action": action,
                "source": source,
                "destination": destination,
                "c2_profile": "smb",
            }),
        )
    }

    #[tokio::test]
    async fn test_add_then_remove() {
        let (store, graph) = graph().await;
        let handler = P2pLinkHandler::new(graph.clone());

        handler.handle(delivery("add", A, B)).await.unwrap();
        assert_eq!(graph.edges().await.len(), 2);
        assert_eq!(store.active_rows().await.len(), 1);

        handler.handle(delivery("remove", B, A)).await.unwrap();
        assert!(graph.edges().await.is_empty());
        assert!(store.active_rows().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_agent_is_not_an_error() {
        let (_, graph) = graph().await;
        let handler = P2pLinkHandler::new(graph.clone());

        let unknown = "9d1c2b3a-0000-4000-8000-000000000000";
        handler.handle(delivery("add", A, unknown)).await.unwrap();
        assert!(graph.edges().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_events_are_rejected() {
        let (_, graph) = graph().await;
        let handler = P2pLinkHandler::new(graph);

        let bad_action = handler.handle(delivery("bounce", A, B)).await;
        assert!(matches!(bad_action, Err(BusError::Serialization(_))));

        let bad_id = handler.handle(delivery("add", "not-a-uuid", B)).await;
        assert!(matches!(bad_id, Err(BusError::Handler(_))));
    }

    #[test]
    fn test_queue_binding() {
        let store = Arc::new(MockGraphStore::new());
        let queue = P2pLinkHandler::queue(Arc::new(CallbackGraph::new(store)), "c2mesh_exchange");
        assert_eq!(queue.binding.queue, P2P_LINK_QUEUE);
        assert_eq!(queue.binding.routing_key, P2P_LINK_QUEUE);
        assert_eq!(queue.binding.exchange, "c2mesh_exchange");
    }
}
