//! Startup notifications.
//!
//! Once bring-up completes, and after a settling delay, one webhook message is
//! emitted per open operation so operators see that the system is back. If
//! the operation list cannot be read, or is empty, a single generic message is
//! sent instead.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::{self, ConnectionManager, OutboundMessage};
use crate::config::StartupConfig;
use crate::storage;

/// Webhook action for startup messages.
pub const WEBHOOK_NEW_STARTUP: &str = "new_startup";

/// An operation that is neither complete nor deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    pub id: i64,
    pub name: String,
    pub webhook: String,
    pub channel: String,
}

/// Lookup of open operations.
#[async_trait]
pub trait OperationStore: Send + Sync + 'static {
    async fn open_operations(&self) -> storage::Result<Vec<OperationRecord>>;
}

/// Body of a webhook message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookMessage {
    pub operation_id: i64,
    pub operation_name: String,
    pub operation_webhook: String,
    pub operation_channel: String,
    pub operator_username: String,
    pub action: String,
    pub data: StartupData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartupData {
    pub startup_message: String,
}

/// Sink for webhook messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &WebhookMessage) -> bus::Result<()>;
}

/// Publishes webhook messages to the webhook emitter's queue.
pub struct BrokerNotifier {
    connections: Arc<ConnectionManager>,
    exchange: String,
    routing_key: String,
}

impl BrokerNotifier {
    pub fn new(
        connections: Arc<ConnectionManager>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            connections,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

#[async_trait]
impl Notifier for BrokerNotifier {
    async fn notify(&self, message: &WebhookMessage) -> bus::Result<()> {
        self.connections
            .publish(OutboundMessage {
                exchange: self.exchange.clone(),
                routing_key: self.routing_key.clone(),
                correlation_id: None,
                body: serde_json::to_vec(message)?,
            })
            .await
    }
}

/// Messages to send for the given operation lookup result.
pub fn startup_messages(
    operations: storage::Result<Vec<OperationRecord>>,
    config: &StartupConfig,
) -> Vec<WebhookMessage> {
    let operations = match operations {
        Ok(ops) if !ops.is_empty() => ops,
        Ok(_) => return vec![generic_message(config)],
        Err(e) => {
            error!(error = %e, "Failed to fetch operations, sending a generic startup message");
            return vec![generic_message(config)];
        }
    };

    operations
        .into_iter()
        .map(|op| WebhookMessage {
            data: StartupData {
                startup_message: format!("{} online for operation {}!", config.system_name, op.name),
            },
            operation_id: op.id,
            operation_name: op.name,
            operation_webhook: op.webhook,
            operation_channel: op.channel,
            operator_username: config.operator_username.clone(),
            action: WEBHOOK_NEW_STARTUP.to_string(),
        })
        .collect()
}

fn generic_message(config: &StartupConfig) -> WebhookMessage {
    WebhookMessage {
        operation_id: 0,
        operation_name: String::new(),
        operation_webhook: String::new(),
        operation_channel: String::new(),
        operator_username: config.operator_username.clone(),
        action: WEBHOOK_NEW_STARTUP.to_string(),
        data: StartupData {
            startup_message: format!("{} online!", config.system_name),
        },
    }
}

/// Look up open operations and send their startup messages.
///
/// Returns the number of messages delivered to the notifier.
pub async fn emit_startup_messages(
    operations: &dyn OperationStore,
    notifier: &dyn Notifier,
    config: &StartupConfig,
) -> usize {
    let messages = startup_messages(operations.open_operations().await, config);

    let mut sent = 0;
    for message in &messages {
        match notifier.notify(message).await {
            Ok(()) => sent += 1,
            Err(e) => warn!(
                operation_id = message.operation_id,
                error = %e,
                "Failed to emit startup message"
            ),
        }
    }

    info!(sent, total = messages.len(), "Startup messages emitted");
    sent
}

/// Send startup messages after the configured delay, in the background.
pub fn schedule_startup_messages(
    operations: Arc<dyn OperationStore>,
    notifier: Arc<dyn Notifier>,
    config: StartupConfig,
) -> JoinHandle<usize> {
    tokio::spawn(async move {
        tokio::time::sleep(config.notification_delay()).await;
        emit_startup_messages(operations.as_ref(), notifier.as_ref(), &config).await
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tokio::sync::Mutex;

    use super::*;
    use crate::bus::BusError;
    use crate::storage::{MockOperationStore, StoreError};

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<WebhookMessage>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, message: &WebhookMessage) -> bus::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BusError::NotConnected);
            }
            self.sent.lock().await.push(message.clone());
            Ok(())
        }
    }

    fn operation(id: i64, name: &str) -> OperationRecord {
        OperationRecord {
            id,
            name: name.to_string(),
            webhook: format!("https://hooks.example/{}", id),
            channel: "#ops".to_string(),
        }
    }

    #[test]
    fn test_one_message_per_open_operation() {
        let config = StartupConfig::default();
        let messages = startup_messages(Ok(vec![operation(1, "alpha"), operation(2, "bravo")]), &config);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].operation_id, 1);
        assert_eq!(messages[0].operation_webhook, "https://hooks.example/1");
        assert_eq!(messages[0].operation_channel, "#ops");
        assert_eq!(messages[0].operator_username, "c2mesh");
        assert_eq!(messages[0].action, WEBHOOK_NEW_STARTUP);
        assert_eq!(messages[1].data.startup_message, "c2mesh online for operation bravo!");
    }

    #[test]
    fn test_generic_message_on_failure_or_empty() {
        let config = StartupConfig::default();

        for result in [Ok(vec![]), Err(StoreError::Database("down".to_string()))] {
            let messages = startup_messages(result, &config);
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].operation_id, 0);
            assert_eq!(messages[0].data.startup_message, "c2mesh online!");
        }
    }

    #[test]
    fn test_message_serializes_as_webhook_body() {
        let config = StartupConfig::default();
        let message = &startup_messages(Ok(vec![operation(3, "charlie")]), &config)[0];

        let json = serde_json::to_value(message).unwrap();
        assert_eq!(json["operation_id"], 3);
        assert_eq!(json["action"], "new_startup");
        assert_eq!(json["data"]["startup_message"], "c2mesh online for operation charlie!");
    }

    #[tokio::test]
    async fn test_emit_counts_delivered_messages() {
        let store = MockOperationStore::new();
        store.add_operation(operation(1, "alpha")).await;
        let notifier = RecordingNotifier::default();

        let sent = emit_startup_messages(&store, &notifier, &StartupConfig::default()).await;
        assert_eq!(sent, 1);
        assert_eq!(notifier.sent.lock().await.len(), 1);

        notifier.fail.store(true, Ordering::SeqCst);
        let sent = emit_startup_messages(&store, &notifier, &StartupConfig::default()).await;
        assert_eq!(sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_after_delay() {
        let store = Arc::new(MockOperationStore::new());
        store.set_fail_on_read(true);
        let notifier = Arc::new(RecordingNotifier::default());

        let handle = schedule_startup_messages(store, notifier.clone(), StartupConfig::default());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(notifier.sent.lock().await.is_empty());

        assert_eq!(handle.await.unwrap(), 1);
        assert_eq!(notifier.sent.lock().await[0].operation_id, 0);
    }
}
