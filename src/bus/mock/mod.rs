//! In-memory broker for testing.
//!
//! Mirrors the broker semantics the core relies on: exclusive consumers,
//! default-exchange routing by queue name, direct routing by
//! `(exchange, routing_key)`, and streams that end when the session drops.
//! Connection failures, bind rejections and disconnects can be injected.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    Broker, BrokerConnection, BusError, Delivery, DeliveryStream, OutboundMessage, QueueBinding,
    Result,
};

struct MockQueue {
    binding: QueueBinding,
    consumers: Vec<mpsc::UnboundedSender<Result<Delivery>>>,
    exclusive: bool,
}

impl MockQueue {
    fn prune(&mut self) {
        self.consumers.retain(|tx| !tx.is_closed());
    }

    fn send(&mut self, delivery: Delivery) -> bool {
        self.prune();
        match self.consumers.first() {
            Some(tx) => tx.send(Ok(delivery)).is_ok(),
            None => false,
        }
    }
}

#[derive(Default)]
struct MockState {
    queues: RwLock<HashMap<String, MockQueue>>,
    published: RwLock<Vec<OutboundMessage>>,
    rejected: RwLock<HashSet<String>>,
    session: RwLock<Option<watch::Sender<bool>>>,
    fail_connects: AtomicUsize,
    attempts: AtomicUsize,
    fail_publish: AtomicBool,
}

/// Mock broker for testing.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<MockState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that refuses the first `attempts` connections.
    pub fn failing_first(attempts: usize) -> Self {
        let broker = Self::new();
        broker.state.fail_connects.store(attempts, Ordering::SeqCst);
        broker
    }

    /// Refuse the next `attempts` connections.
    pub fn fail_next_connects(&self, attempts: usize) {
        self.state.fail_connects.store(attempts, Ordering::SeqCst);
    }

    /// Connection attempts seen so far, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Make any bind of `queue` fail.
    pub async fn reject_queue(&self, queue: &str) {
        self.state.rejected.write().await.insert(queue.to_string());
    }

    pub fn set_fail_on_publish(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Hand a delivery to the consumer of `queue`.
    pub async fn deliver(&self, queue: &str, delivery: Delivery) -> Result<()> {
        let mut queues = self.state.queues.write().await;
        let delivered = queues
            .get_mut(queue)
            .map(|q| q.send(delivery))
            .unwrap_or(false);

        if delivered {
            Ok(())
        } else {
            Err(BusError::Publish(format!("no consumer on queue '{}'", queue)))
        }
    }

    pub async fn published(&self) -> Vec<OutboundMessage> {
        self.state.published.read().await.clone()
    }

    pub async fn take_published(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.state.published.write().await)
    }

    /// Consumers attached to `queue` right now.
    pub async fn consumers(&self, queue: &str) -> usize {
        let mut queues = self.state.queues.write().await;
        queues
            .get_mut(queue)
            .map(|q| {
                q.prune();
                q.consumers.len()
            })
            .unwrap_or(0)
    }

    /// Drop the current session: every consumer stream ends and the
    /// connection reports itself closed.
    pub async fn disconnect(&self) {
        if let Some(session) = self.state.session.write().await.take() {
            let _ = session.send(true);
        }
        self.state.queues.write().await.clear();
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .state
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BusError::Connection("mock broker unreachable".to_string()));
        }

        let (tx, rx) = watch::channel(false);
        if let Some(previous) = self.state.session.write().await.replace(tx) {
            let _ = previous.send(true);
        }

        Ok(Arc::new(MockConnection {
            state: Arc::clone(&self.state),
            closed: rx,
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
    closed: watch::Receiver<bool>,
}

impl MockConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BusError::Connection("mock session closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn consume(&self, binding: &QueueBinding, exclusive: bool) -> Result<DeliveryStream> {
        self.ensure_open()?;

        if self.state.rejected.read().await.contains(&binding.queue) {
            return Err(BusError::Subscribe(format!(
                "bind rejected for queue '{}'",
                binding.queue
            )));
        }

        let mut queues = self.state.queues.write().await;
        let queue = queues
            .entry(binding.queue.clone())
            .or_insert_with(|| MockQueue {
                binding: binding.clone(),
                consumers: Vec::new(),
                exclusive,
            });
        queue.prune();

        if !queue.consumers.is_empty() && (exclusive || queue.exclusive) {
            return Err(BusError::Subscribe(format!(
                "queue '{}' is locked by an exclusive consumer",
                binding.queue
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        queue.binding = binding.clone();
        queue.exclusive = exclusive;
        queue.consumers.push(tx);

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        self.ensure_open()?;

        if self.state.fail_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish("mock publish failure".to_string()));
        }

        {
            let mut queues = self.state.queues.write().await;
            for (name, queue) in queues.iter_mut() {
                let by_name = message.exchange.is_empty() && *name == message.routing_key;
                let by_binding = !message.exchange.is_empty()
                    && queue.binding.exchange == message.exchange
                    && queue.binding.routing_key == message.routing_key;
                if by_name || by_binding {
                    queue.send(Delivery {
                        body: message.body.clone(),
                        exchange: message.exchange.clone(),
                        routing_key: message.routing_key.clone(),
                        reply_to: None,
                        correlation_id: message.correlation_id.clone(),
                    });
                }
            }
        }

        self.state.published.write().await.push(message);
        Ok(())
    }

    async fn consumer_count(&self, queue: &str) -> Result<u32> {
        self.ensure_open()?;
        let mut queues = self.state.queues.write().await;
        Ok(queues
            .get_mut(queue)
            .map(|q| {
                q.prune();
                q.consumers.len() as u32
            })
            .unwrap_or(0))
    }

    fn is_connected(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.closed.clone();
        loop {
            let closed = *rx.borrow_and_update();
            if closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
