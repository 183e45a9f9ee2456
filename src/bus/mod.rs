//! Message broker plumbing.
//!
//! This module contains:
//! - `Broker` / `BrokerConnection` traits: the single physical broker session
//! - `RpcHandler` / `DirectHandler` traits: per-queue message handlers
//! - `QueueRegistry`: consumer intents collected before bring-up
//! - `ConnectionManager`: connect-with-retry and listener spawning
//! - Implementations: AMQP (RabbitMQ), Mock

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod health;
pub mod manager;
pub mod mock;
pub mod registry;


// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpConfig};
pub use health::{ContainerCheck, ContainerStatus, QueueConsumerCheck};
pub use manager::{ConnectionManager, ListenerSummary};
pub use mock::MockBroker;
pub use registry::{
    direct_handler_fn, rpc_handler_fn, DirectQueue, QueueRegistry, RegisteredQueues, RpcQueue,
};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Listeners already started")]
    AlreadyStarted,

    #[error("Listeners not started")]
    NotStarted,
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for BusError {
    fn from(err: lapin::Error) -> Self {
        BusError::Connection(err.to_string())
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Broker address of one consumer binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueBinding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl QueueBinding {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// An inbound message taken off a queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    /// Queue an RPC caller is waiting on for the reply.
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
}

impl Delivery {
    /// Build a delivery carrying a JSON body.
    pub fn json(routing_key: impl Into<String>, body: &serde_json::Value) -> Self {
        Self {
            body: body.to_string().into_bytes(),
            routing_key: routing_key.into(),
            ..Default::default()
        }
    }

    /// Decode the body as JSON.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// An outbound message to publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
}

/// Stream of deliveries for one consumer. Ends when the connection drops.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

// ============================================================================
// Traits
// ============================================================================

/// Handler for an RPC queue. The returned value is sent back to the caller.
pub trait RpcHandler: Send + Sync {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, Result<serde_json::Value>>;
}

/// Handler for a fire-and-forget direct queue.
pub trait DirectHandler: Send + Sync {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, Result<()>>;
}

/// Factory for broker sessions.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `MockBroker`: In-memory broker for testing
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new session. Called repeatedly by the connection manager until
    /// it succeeds.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;
}

/// A live broker session shared by every consumer and publisher.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Declare the queue, bind it to its exchange and start consuming.
    ///
    /// With `exclusive` set, the broker refuses a second consumer on the same
    /// queue. Failure here is a bind failure, not a transient error.
    async fn consume(&self, binding: &QueueBinding, exclusive: bool) -> Result<DeliveryStream>;

    /// Publish a message.
    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    /// Number of consumers currently attached to `queue`.
    async fn consumer_count(&self, queue: &str) -> Result<u32>;

    /// Whether the session is still usable.
    fn is_connected(&self) -> bool;

    /// Resolves once the session has been lost.
    async fn closed(&self);
}
