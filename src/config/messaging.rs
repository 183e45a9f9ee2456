//! Messaging and broker configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Default exchange every core queue is bound to.
pub const DEFAULT_EXCHANGE: &str = "c2mesh_exchange";

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-memory broker (no external broker, single process).
    #[default]
    Memory,
    /// AMQP/RabbitMQ messaging.
    Amqp,
}

/// Messaging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP-specific configuration.
    pub amqp: AmqpSettings,
    /// Exchange the core's own queues are bound to.
    pub exchange: String,
    /// Fixed delay between connection attempts, in milliseconds.
    pub retry_delay_ms: u64,
    /// Respawn listeners after a mid-run disconnect instead of exiting.
    pub reconnect: bool,
}

impl MessagingConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            messaging_type: MessagingType::Memory,
            amqp: AmqpSettings::default(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            retry_delay_ms: 1000,
            reconnect: true,
        }
    }
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    /// AMQP connection URL.
    pub url: String,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
        }
    }
}
