//! AMQP (RabbitMQ) broker implementation.
//!
//! One physical connection per session. Each consumer gets its own channel;
//! publishing shares a single confirm-mode channel opened at connect time.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{
    Broker, BrokerConnection, BusError, Delivery, DeliveryStream, OutboundMessage, QueueBinding,
    Result,
};

/// Configuration for the AMQP broker.
#[derive(Clone, Debug)]
pub struct AmqpConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Tag prefix for consumers started by this process.
    pub consumer_tag: String,
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            consumer_tag: "c2mesh".to_string(),
        }
    }
}

/// Broker factory over lapin.
pub struct AmqpBroker {
    config: AmqpConfig,
}

impl AmqpBroker {
    pub fn new(config: AmqpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let connection = Connection::connect(&self.config.url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let on_error = Arc::clone(&closed_tx);
        connection.on_error(move |e| {
            error!(error = %e, "AMQP connection error");
            let _ = on_error.send(true);
        });

        let publisher = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to enable confirms: {}", e)))?;

        info!(url = %redact(&self.config.url), "Connected to AMQP");

        Ok(Arc::new(AmqpConnection {
            connection,
            publisher,
            consumer_tag: self.config.consumer_tag.clone(),
            closed_tx,
            closed_rx,
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    publisher: Channel,
    consumer_tag: String,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
}

impl AmqpConnection {
    async fn channel(&self) -> Result<Channel> {
        self.connection.create_channel().await.map_err(|e| {
            if !self.connection.status().connected() {
                let _ = self.closed_tx.send(true);
            }
            BusError::Connection(format!("Failed to create channel: {}", e))
        })
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn consume(&self, binding: &QueueBinding, exclusive: bool) -> Result<DeliveryStream> {
        let channel = self.channel().await?;

        if !binding.exchange.is_empty() {
            channel
                .exchange_declare(
                    &binding.exchange,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Subscribe(format!("Failed to declare exchange: {}", e)))?;
        }

        channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        if !binding.exchange.is_empty() {
            channel
                .queue_bind(
                    &binding.queue,
                    &binding.exchange,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;
        }

        let consumer = channel
            .basic_consume(
                &binding.queue,
                &format!("{}-{}", self.consumer_tag, binding.queue),
                BasicConsumeOptions {
                    no_ack: true,
                    exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        debug!(
            queue = %binding.queue,
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            exclusive,
            "Bound queue to exchange"
        );

        // The channel must outlive the consumer stream.
        let stream = consumer.map(move |delivery| {
            let _channel = &channel;
            delivery
                .map(|d| Delivery {
                    reply_to: d.properties.reply_to().as_ref().map(|s| s.to_string()),
                    correlation_id: d.properties.correlation_id().as_ref().map(|s| s.to_string()),
                    exchange: d.exchange.to_string(),
                    routing_key: d.routing_key.to_string(),
                    body: d.data,
                })
                .map_err(|e| BusError::Connection(format!("Consumer error: {}", e)))
        });

        Ok(stream.boxed())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let mut properties = BasicProperties::default().with_content_type("application/json".into());
        if let Some(correlation_id) = &message.correlation_id {
            properties = properties.with_correlation_id(correlation_id.as_str().into());
        }

        self.publisher
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        debug!(
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            "Published message"
        );

        Ok(())
    }

    async fn consumer_count(&self, queue: &str) -> Result<u32> {
        // A failed passive declare closes its channel, so use a throwaway one.
        let channel = self.channel().await?;
        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        match declared {
            Ok(q) => {
                let _ = channel.close(200, "OK").await;
                Ok(q.consumer_count())
            }
            // Queue does not exist: nobody is consuming it.
            Err(lapin::Error::ProtocolError(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn is_connected(&self) -> bool {
        !*self.closed_rx.borrow() && self.connection.status().connected()
    }

    async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        loop {
            if *rx.borrow_and_update() || !self.connection.status().connected() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Strip credentials from an AMQP URL for logging.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***@{}", &url[..scheme], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
