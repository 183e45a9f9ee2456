//! Queue handlers backed by the callback graph.

pub mod graph_rpc;
pub mod p2p;

use std::sync::Arc;

use crate::bus::QueueRegistry;
use crate::graph::CallbackGraph;

pub use graph_rpc::{GraphRequest, GraphRpcHandler, GRAPH_RPC_QUEUE};
pub use p2p::{LinkAction, P2pLinkEvent, P2pLinkHandler, P2P_LINK_QUEUE};

/// Register every graph-backed queue on `exchange`.
pub async fn register_graph_queues(
    registry: &QueueRegistry,
    graph: &Arc<CallbackGraph>,
    exchange: &str,
) {
    registry
        .add_direct_queue(P2pLinkHandler::queue(Arc::clone(graph), exchange))
        .await;
    registry
        .add_rpc_queue(GraphRpcHandler::queue(Arc::clone(graph), exchange))
        .await;
}
