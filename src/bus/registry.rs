//! Queue registry: consumer intents collected before bring-up.
//!
//! Subsystems register RPC and direct queues during startup, before the broker
//! is known to be reachable. `ConnectionManager::start_all` takes a snapshot of
//! the registry; anything registered after that point is never consumed.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Delivery, DirectHandler, QueueBinding, Result, RpcHandler};

/// An RPC queue: each delivery produces a reply.
#[derive(Clone)]
pub struct RpcQueue {
    pub binding: QueueBinding,
    pub handler: Arc<dyn RpcHandler>,
}

impl RpcQueue {
    pub fn new(binding: QueueBinding, handler: Arc<dyn RpcHandler>) -> Self {
        Self { binding, handler }
    }
}

/// A direct queue: deliveries are handled without a reply.
#[derive(Clone)]
pub struct DirectQueue {
    pub binding: QueueBinding,
    pub handler: Arc<dyn DirectHandler>,
}

impl DirectQueue {
    pub fn new(binding: QueueBinding, handler: Arc<dyn DirectHandler>) -> Self {
        Self { binding, handler }
    }
}

/// Registered queues, in registration order.
#[derive(Clone, Default)]
pub struct RegisteredQueues {
    pub rpc: Vec<RpcQueue>,
    pub direct: Vec<DirectQueue>,
}

impl RegisteredQueues {
    pub fn len(&self) -> usize {
        self.rpc.len() + self.direct.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Table of queues to consume once the broker is up.
///
/// No dedup and no validation: registering the same binding twice yields two
/// consumers, and malformed bindings only fail when the broker rejects them.
#[derive(Default)]
pub struct QueueRegistry {
    queues: RwLock<RegisteredQueues>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_rpc_queue(&self, queue: RpcQueue) {
        debug!(queue = %queue.binding.queue, exchange = %queue.binding.exchange, "registered rpc queue");
        self.queues.write().await.rpc.push(queue);
    }

    pub async fn add_direct_queue(&self, queue: DirectQueue) {
        debug!(queue = %queue.binding.queue, exchange = %queue.binding.exchange, "registered direct queue");
        self.queues.write().await.direct.push(queue);
    }

    /// Copy of everything registered so far.
    pub async fn snapshot(&self) -> RegisteredQueues {
        self.queues.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.queues.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

struct FnRpcHandler<F>(F);

impl<F, Fut> RpcHandler for FnRpcHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, Result<serde_json::Value>> {
        (self.0)(delivery).boxed()
    }
}

struct FnDirectHandler<F>(F);

impl<F, Fut> DirectHandler for FnDirectHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, Result<()>> {
        (self.0)(delivery).boxed()
    }
}

/// Wrap an async closure as an RPC handler.
pub fn rpc_handler_fn<F, Fut>(f: F) -> Arc<dyn RpcHandler>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    Arc::new(FnRpcHandler(f))
}

/// Wrap an async closure as a direct handler.
pub fn direct_handler_fn<F, Fut>(f: F) -> Arc<dyn DirectHandler>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnDirectHandler(f))
}
