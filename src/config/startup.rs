//! Startup notification configuration.

use std::time::Duration;

use serde::Deserialize;

use super::messaging::DEFAULT_EXCHANGE;

/// Settings for the messages emitted once bring-up completes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Delay after bring-up before the messages go out.
    pub notification_delay_secs: u64,
    /// Name reported as the sender of startup messages.
    pub operator_username: String,
    /// System name used in the message text.
    pub system_name: String,
    /// Where startup messages are published.
    pub webhook: WebhookConfig,
}

impl StartupConfig {
    pub fn notification_delay(&self) -> Duration {
        Duration::from_secs(self.notification_delay_secs)
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            notification_delay_secs: 30,
            operator_username: "c2mesh".to_string(),
            system_name: "c2mesh".to_string(),
            webhook: WebhookConfig::default(),
        }
    }
}

/// Broker address of the webhook emitter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub exchange: String,
    pub routing_key: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            routing_key: "emit_webhook.new_startup".to_string(),
        }
    }
}
