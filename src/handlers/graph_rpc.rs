//! Operator graph RPC handler.
//!
//! Operators edit and inspect the callback graph through one RPC queue. The
//! request names an action; the reply is `{"status": "success", ...}` or, when
//! the graph rejects the request, `{"status": "error", "error": ...}`.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::bus::{self, Delivery, QueueBinding, RpcHandler, RpcQueue};
use crate::graph::{CallbackGraph, EdgeChange, GraphEdge};

/// Queue and routing key for operator graph requests.
pub const GRAPH_RPC_QUEUE: &str = "callback_graph_rpc";

/// An operator request against the callback graph.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GraphRequest {
    /// Link two callbacks by their per-operation display ids.
    Link {
        source_display_id: i64,
        destination_display_id: i64,
        c2_profile: String,
        operation_id: i64,
    },
    /// Close one persisted edge.
    UnlinkEdge { edge_id: i64, operation_id: i64 },
    /// Fewest-hop route between two callbacks.
    Path { source_id: i64, destination_id: i64 },
    /// Whether a callback has any live neighbor.
    Reachable { callback_id: i64 },
    Edges,
}

pub struct GraphRpcHandler {
    graph: Arc<CallbackGraph>,
}

impl GraphRpcHandler {
    pub fn new(graph: Arc<CallbackGraph>) -> Self {
        Self { graph }
    }

    /// RPC queue registration for this handler.
    pub fn queue(graph: Arc<CallbackGraph>, exchange: &str) -> RpcQueue {
        RpcQueue::new(
            QueueBinding::new(exchange, GRAPH_RPC_QUEUE, GRAPH_RPC_QUEUE),
            Arc::new(Self::new(graph)),
        )
    }

    async fn dispatch(graph: &CallbackGraph, request: GraphRequest) -> Value {
        match request {
            GraphRequest::Link {
                source_display_id,
                destination_display_id,
                c2_profile,
                operation_id,
            } => change_reply(
                graph
                    .link_by_display_id(
                        source_display_id,
                        destination_display_id,
                        &c2_profile,
                        operation_id,
                    )
                    .await,
            ),
            GraphRequest::UnlinkEdge {
                edge_id,
                operation_id,
            } => change_reply(graph.unlink_by_edge_id(edge_id, operation_id).await),
            GraphRequest::Path {
                source_id,
                destination_id,
            } => {
                let path = graph.shortest_path(source_id, destination_id).await;
                json!({ "status": "success", "path": edges_json(&path) })
            }
            GraphRequest::Reachable { callback_id } => json!({
                "status": "success",
                "reachable": graph.can_reach_delegates(callback_id).await,
            }),
            GraphRequest::Edges => {
                json!({ "status": "success", "edges": edges_json(&graph.edges().await) })
            }
        }
    }
}

impl RpcHandler for GraphRpcHandler {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, bus::Result<Value>> {
        let graph = Arc::clone(&self.graph);

        async move {
            let request: GraphRequest = delivery.decode()?;
            debug!(request = ?request, "Graph RPC request");
            Ok(Self::dispatch(&graph, request).await)
        }
        .boxed()
    }
}

fn change_reply(result: crate::graph::Result<EdgeChange>) -> Value {
    match result {
        Ok(EdgeChange::StorageFailed(message)) => {
            json!({ "status": "error", "error": message })
        }
        Ok(change) => json!({ "status": "success", "outcome": outcome_label(&change) }),
        Err(e) => {
            warn!(error = %e, "Graph RPC request rejected");
            json!({ "status": "error", "error": e.to_string() })
        }
    }
}

fn outcome_label(change: &EdgeChange) -> &'static str {
    match change {
        EdgeChange::Linked => "linked",
        EdgeChange::AlreadyLinked => "already_linked",
        EdgeChange::Unlinked => "unlinked",
        EdgeChange::NotLinked => "not_linked",
        EdgeChange::UnknownCallback(_) => "unknown_callback",
        EdgeChange::StorageFailed(_) => "storage_failed",
    }
}

fn edges_json(edges: &[GraphEdge]) -> Value {
    edges
        .iter()
        .map(|e| {
            json!({
                "source_id": e.source_id,
                "destination_id": e.destination_id,
                "source_agent_id": e.source_agent_id,
                "destination_agent_id": e.destination_agent_id,
                "c2_profile": e.c2_profile_name,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NewEdge;
    use crate::storage::MockGraphStore;

    async fn fixture() -> (Arc<MockGraphStore>, GraphRpcHandler) {
        let store = Arc::new(MockGraphStore::new());
        store.add_callback(1, "agent-1", 1, 11).await;
        store.add_callback(2, "agent-2", 1, 12).await;
        store.add_callback(3, "agent-3", 1, 13).await;
        store.add_profile(7, "smb").await;
        let graph = Arc::new(CallbackGraph::new(store.clone()));
        (store, GraphRpcHandler::new(graph))
    }

    async fn call(handler: &GraphRpcHandler, request: Value) -> Value {
        handler
            .handle(Delivery::json(GRAPH_RPC_QUEUE, &request))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_link_then_path() {
        let (_, handler) = fixture().await;

        for (a, b) in [(11, 12), (12, 13)] {
            let reply = call(
                &handler,
                json!({
                    "action": "link",
                    "source_display_id": a,
                    "destination_display_id": b,
                    "c2_profile": "smb",
                    "operation_id": 1,
                }),
            )
            .await;
            assert_eq!(reply["outcome"], "linked");
        }

        let reply = call(
            &handler,
            json!({ "action": "path", "source_id": 1, "destination_id": 3 }),
        )
        .await;
        let path = reply["path"].as_array().unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path[0]["destination_id"], 2);
        assert_eq!(path[1]["destination_agent_id"], "agent-3");

        let reply = call(&handler, json!({ "action": "reachable", "callback_id": 3 })).await;
        assert_eq!(reply["reachable"], true);
    }

    #[tokio::test]
    async fn test_unlink_edge_from_other_operation_is_an_error_reply() {
        let (store, handler) = fixture().await;
        let edge_id = store
            .seed_edge(
                NewEdge {
                    operation_id: 1,
                    source_id: 1,
                    destination_id: 2,
                    c2_profile_id: 7,
                },
                true,
            )
            .await;

        let reply = call(
            &handler,
            json!({ "action": "unlink_edge", "edge_id": edge_id, "operation_id": 2 }),
        )
        .await;
        assert_eq!(reply["status"], "error");

        let reply = call(
            &handler,
            json!({ "action": "unlink_edge", "edge_id": edge_id, "operation_id": 1 }),
        )
        .await;
        assert_eq!(reply["status"], "success");
        assert_eq!(reply["outcome"], "unlinked");
        assert!(store.active_rows().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action_fails_decoding() {
        let (_, handler) = fixture().await;
        let result = handler
            .handle(Delivery::json(GRAPH_RPC_QUEUE, &json!({ "action": "explode" })))
            .await;
        assert!(matches!(result, Err(bus::BusError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_edges_lists_both_directions() {
        let (_, handler) = fixture().await;
        call(
            &handler,
            json!({
                "action": "link",
                "source_display_id": 11,
                "destination_display_id": 12,
                "c2_profile": "smb",
                "operation_id": 1,
            }),
        )
        .await;

        let reply = call(&handler, json!({ "action": "edges" })).await;
        assert_eq!(reply["edges"].as_array().unwrap().len(), 2);
    }
}
