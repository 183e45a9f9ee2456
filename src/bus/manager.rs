//! Broker connection lifecycle and listener spawning.
//!
//! The manager owns the one broker session. `ensure_connected` blocks until the
//! broker is reachable, retrying forever with a fixed delay. `start_all` then
//! seals the queue registry and spawns one consumer task per registered queue
//! plus the periodic container check.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder};
use futures::{FutureExt, StreamExt};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::health::ContainerCheck;
use super::registry::{DirectQueue, QueueRegistry, RegisteredQueues, RpcQueue};
use super::{
    Broker, BrokerConnection, BusError, Delivery, DeliveryStream, OutboundMessage, Result,
};

/// Every queue is consumed exclusively so that horizontally scaled instances
/// never double-handle the same queue.
const EXCLUSIVE_CONSUMERS: bool = true;

type SharedConnection = Arc<RwLock<Option<Arc<dyn BrokerConnection>>>>;

/// Listeners spawned by one `start_all` / `respawn_listeners` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerSummary {
    pub rpc: usize,
    pub direct: usize,
    pub health_check: bool,
}

impl ListenerSummary {
    /// Total tasks spawned, including the container check.
    pub fn total(&self) -> usize {
        self.rpc + self.direct + usize::from(self.health_check)
    }
}

struct HealthTask {
    check: Arc<dyn ContainerCheck>,
    interval: Duration,
}

/// Owner of the broker session and its consumer tasks.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    registry: Arc<QueueRegistry>,
    connection: SharedConnection,
    connect_lock: Mutex<()>,
    retry_delay: Duration,
    health: Option<HealthTask>,
    sealed: Mutex<Option<RegisteredQueues>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    spawned: AtomicUsize,
}

impl ConnectionManager {
    /// Create a manager. Nothing connects until `ensure_connected`.
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<QueueRegistry>, retry_delay: Duration) -> Self {
        Self {
            broker,
            registry,
            connection: Arc::new(RwLock::new(None)),
            connect_lock: Mutex::new(()),
            retry_delay,
            health: None,
            sealed: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            health_task: Mutex::new(None),
            spawned: AtomicUsize::new(0),
        }
    }

    /// Poll `check` every `interval` once listeners are started.
    pub fn with_container_check(mut self, check: Arc<dyn ContainerCheck>, interval: Duration) -> Self {
        self.health = Some(HealthTask { check, interval });
        self
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    /// Block until a broker session is established and return it.
    ///
    /// Never gives up: the host cannot function without the broker. Each
    /// failed attempt is logged and retried after the fixed delay.
    pub async fn ensure_connected(&self) -> Arc<dyn BrokerConnection> {
        let _guard = self.connect_lock.lock().await;

        if let Some(conn) = self.current().await {
            return conn;
        }

        let mut backoff = ConstantBuilder::default()
            .with_delay(self.retry_delay)
            .without_max_times()
            .build();
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            match self.broker.connect().await {
                Ok(conn) => {
                    *self.connection.write().await = Some(Arc::clone(&conn));
                    info!(attempt, "Connected to broker");
                    return conn;
                }
                Err(e) => {
                    let delay = backoff.next().unwrap_or(self.retry_delay);
                    warn!(
                        attempt,
                        error = %e,
                        retry_ms = %delay.as_millis(),
                        "Waiting for broker..."
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// The current session, if one is established and still usable.
    pub async fn connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        self.current().await.ok_or(BusError::NotConnected)
    }

    async fn current(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.connection
            .read()
            .await
            .as_ref()
            .filter(|conn| conn.is_connected())
            .cloned()
    }

    /// Publish through the current session.
    pub async fn publish(&self, message: OutboundMessage) -> Result<()> {
        self.connection().await?.publish(message).await
    }

    /// Seal the registry and spawn every listener. Callable exactly once.
    ///
    /// All queues are bound before any consumer task is spawned; a binding the
    /// broker rejects aborts bring-up with an error. A repeated descriptor whose
    /// queue is already held by an earlier consumer is logged and skipped.
    pub async fn start_all(&self) -> Result<ListenerSummary> {
        let mut sealed = self.sealed.lock().await;
        if sealed.is_some() {
            return Err(BusError::AlreadyStarted);
        }

        let queues = self.registry.snapshot().await;
        let summary = self.spawn_listeners(&queues).await?;
        *sealed = Some(queues);
        Ok(summary)
    }

    /// Replace all listeners after a reconnect, from the registry snapshot
    /// sealed by `start_all`.
    pub async fn respawn_listeners(&self) -> Result<ListenerSummary> {
        let sealed = self.sealed.lock().await;
        let queues = sealed.as_ref().ok_or(BusError::NotStarted)?;
        self.spawn_listeners(queues).await
    }

    /// Consumer tasks from the last spawn that are still running.
    pub async fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .await
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Consumer tasks spawned over the manager's lifetime.
    pub fn spawned_consumers(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Abort every listener and the container check.
    pub async fn shutdown(&self) {
        Self::abort_all(&mut *self.listeners.lock().await).await;
        if let Some(handle) = self.health_task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    async fn abort_all(handles: &mut Vec<JoinHandle<()>>) {
        for handle in handles.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
    }

    async fn spawn_listeners(&self, queues: &RegisteredQueues) -> Result<ListenerSummary> {
        let connection = self.connection().await?;

        let mut listeners = self.listeners.lock().await;
        Self::abort_all(&mut listeners).await;

        let mut bound = HashSet::new();

        let mut rpc_streams = Vec::with_capacity(queues.rpc.len());
        for queue in &queues.rpc {
            if let Some(stream) = Self::bind(connection.as_ref(), &queue.binding, &mut bound).await? {
                rpc_streams.push((queue.clone(), stream));
            }
        }

        let mut direct_streams = Vec::with_capacity(queues.direct.len());
        for queue in &queues.direct {
            if let Some(stream) = Self::bind(connection.as_ref(), &queue.binding, &mut bound).await? {
                direct_streams.push((queue.clone(), stream));
            }
        }

        let mut summary = ListenerSummary::default();

        for (queue, stream) in rpc_streams {
            let conn = Arc::clone(&connection);
            listeners.push(tokio::spawn(run_rpc_consumer(queue, stream, conn)));
            summary.rpc += 1;
        }

        for (queue, stream) in direct_streams {
            listeners.push(tokio::spawn(run_direct_consumer(queue, stream)));
            summary.direct += 1;
        }

        self.spawned
            .fetch_add(summary.rpc + summary.direct, Ordering::SeqCst);

        if let Some(health) = &self.health {
            let mut task = self.health_task.lock().await;
            if task.as_ref().map_or(true, |handle| handle.is_finished()) {
                *task = Some(self.spawn_container_check(health));
            }
            summary.health_check = true;
        }

        info!(
            rpc = summary.rpc,
            direct = summary.direct,
            health_check = summary.health_check,
            "Listeners started"
        );

        Ok(summary)
    }

    /// Bind one descriptor. `Ok(None)` means the queue is already consumed by
    /// an earlier descriptor in this pass and this duplicate was skipped.
    async fn bind(
        connection: &dyn BrokerConnection,
        binding: &super::QueueBinding,
        bound: &mut HashSet<String>,
    ) -> Result<Option<DeliveryStream>> {
        match connection.consume(binding, EXCLUSIVE_CONSUMERS).await {
            Ok(stream) => {
                bound.insert(binding.queue.clone());
                Ok(Some(stream))
            }
            Err(e) if bound.contains(&binding.queue) => {
                warn!(
                    queue = %binding.queue,
                    error = %e,
                    "Duplicate consumer for queue not started"
                );
                Ok(None)
            }
            Err(e) => {
                error!(
                    queue = %binding.queue,
                    exchange = %binding.exchange,
                    routing_key = %binding.routing_key,
                    error = %e,
                    "Failed to bind queue"
                );
                Err(e)
            }
        }
    }

    fn spawn_container_check(&self, health: &HealthTask) -> JoinHandle<()> {
        let connection = Arc::clone(&self.connection);
        let check = Arc::clone(&health.check);
        let period = health.interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                let current = connection.read().await.clone();
                match current {
                    Some(conn) if conn.is_connected() => check.check(conn.as_ref()).await,
                    _ => debug!("Skipping container check, broker not connected"),
                }
            }
        })
    }
}

/// Consume an RPC queue until its stream ends, replying to each delivery.
async fn run_rpc_consumer(
    queue: RpcQueue,
    mut deliveries: DeliveryStream,
    connection: Arc<dyn BrokerConnection>,
) {
    info!(queue = %queue.binding.queue, "RPC consumer started");

    while let Some(delivery) = deliveries.next().await {
        match delivery {
            Ok(delivery) => handle_rpc_delivery(&queue, delivery, connection.as_ref()).await,
            Err(e) => {
                error!(queue = %queue.binding.queue, error = %e, "Consumer delivery error");
                break;
            }
        }
    }

    info!(queue = %queue.binding.queue, "RPC consumer stopped");
}

async fn handle_rpc_delivery(queue: &RpcQueue, delivery: Delivery, connection: &dyn BrokerConnection) {
    let reply_to = delivery.reply_to.clone();
    let correlation_id = delivery.correlation_id.clone();

    let handler = Arc::clone(&queue.handler);
    let outcome = AssertUnwindSafe(async move { handler.handle(delivery).await })
        .catch_unwind()
        .await;

    let reply = match outcome {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            error!(queue = %queue.binding.queue, error = %e, "RPC handler failed");
            error_reply(&e.to_string())
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(queue = %queue.binding.queue, panic = %message, "RPC handler panicked");
            error_reply(&message)
        }
    };

    let Some(reply_to) = reply_to.filter(|r| !r.is_empty()) else {
        debug!(queue = %queue.binding.queue, "RPC delivery has no reply_to, dropping reply");
        return;
    };

    let message = OutboundMessage {
        exchange: String::new(),
        routing_key: reply_to,
        correlation_id,
        body: reply.to_string().into_bytes(),
    };

    if let Err(e) = connection.publish(message).await {
        error!(queue = %queue.binding.queue, error = %e, "Failed to publish RPC reply");
    }
}

/// Consume a direct queue until its stream ends.
async fn run_direct_consumer(queue: DirectQueue, mut deliveries: DeliveryStream) {
    info!(queue = %queue.binding.queue, "Direct consumer started");

    while let Some(delivery) = deliveries.next().await {
        match delivery {
            Ok(delivery) => {
                let handler = Arc::clone(&queue.handler);
                let outcome = AssertUnwindSafe(async move { handler.handle(delivery).await })
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(queue = %queue.binding.queue, error = %e, "Direct handler failed");
                    }
                    Err(panic) => {
                        error!(
                            queue = %queue.binding.queue,
                            panic = %panic_message(panic.as_ref()),
                            "Direct handler panicked"
                        );
                    }
                }
            }
            Err(e) => {
                error!(queue = %queue.binding.queue, error = %e, "Consumer delivery error");
                break;
            }
        }
    }

    info!(queue = %queue.binding.queue, "Direct consumer stopped");
}

fn error_reply(message: &str) -> serde_json::Value {
    serde_json::json!({ "status": "error", "error": message })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
