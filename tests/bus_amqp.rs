//! AMQP/RabbitMQ broker integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp --features amqp -- --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::mpsc;

use c2mesh::bus::{
    direct_handler_fn, rpc_handler_fn, AmqpBroker, AmqpConfig, Broker, BusError,
    ConnectionManager, Delivery, DirectQueue, OutboundMessage, QueueBinding, QueueRegistry,
    RpcQueue,
};

const EXCHANGE: &str = "c2mesh_it";

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);

    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

fn binding(queue: &str) -> QueueBinding {
    QueueBinding::new(EXCHANGE, queue, queue)
}

async fn started_manager(url: &str, registry: Arc<QueueRegistry>) -> ConnectionManager {
    let broker = Arc::new(AmqpBroker::new(AmqpConfig::new(url)));
    let manager = ConnectionManager::new(broker, registry, Duration::from_millis(200));
    manager.ensure_connected().await;
    manager.start_all().await.expect("start_all should succeed");
    manager
}

#[tokio::test]
async fn test_rpc_reply_reaches_reply_queue() {
    let (_container, url) = start_rabbitmq().await;

    let registry = Arc::new(QueueRegistry::new());
    registry
        .add_rpc_queue(RpcQueue::new(
            binding("it_echo"),
            rpc_handler_fn(|delivery: Delivery| async move {
                let body: serde_json::Value = delivery.decode()?;
                Ok(serde_json::json!({ "status": "success", "echo": body }))
            }),
        ))
        .await;
    let manager = started_manager(&url, registry).await;

    // Caller side: a reply queue on the default exchange.
    let caller = AmqpBroker::new(AmqpConfig::new(url.as_str()))
        .connect()
        .await
        .expect("caller should connect");
    let mut replies = caller
        .consume(&QueueBinding::new("", "it_replies", "it_replies"), false)
        .await
        .expect("reply queue should bind");

    let raw = Connection::connect(&url, ConnectionProperties::default())
        .await
        .expect("raw connection");
    let channel = raw.create_channel().await.expect("raw channel");
    channel
        .basic_publish(
            EXCHANGE,
            "it_echo",
            BasicPublishOptions::default(),
            br#"{"ping":1}"#,
            BasicProperties::default()
                .with_reply_to("it_replies".into())
                .with_correlation_id("corr-42".into()),
        )
        .await
        .expect("publish request")
        .await
        .expect("request confirm");

    let reply = tokio::time::timeout(Duration::from_secs(10), replies.next())
        .await
        .expect("reply should arrive")
        .expect("stream should be open")
        .expect("delivery should decode");

    assert_eq!(reply.correlation_id.as_deref(), Some("corr-42"));
    let body: serde_json::Value = reply.decode().unwrap();
    assert_eq!(body["status"], "success");
    assert_eq!(body["echo"]["ping"], 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_direct_queue_receives_in_order() {
    let (_container, url) = start_rabbitmq().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let registry = Arc::new(QueueRegistry::new());
    registry
        .add_direct_queue(DirectQueue::new(
            binding("it_direct"),
            direct_handler_fn(move |delivery: Delivery| {
                let tx = tx.clone();
                async move {
                    let n: u32 = delivery.decode()?;
                    let _ = tx.send(n);
                    Ok(())
                }
            }),
        ))
        .await;
    let manager = started_manager(&url, registry).await;

    for n in 0..5u32 {
        manager
            .publish(OutboundMessage {
                exchange: EXCHANGE.to_string(),
                routing_key: "it_direct".to_string(),
                correlation_id: None,
                body: n.to_string().into_bytes(),
            })
            .await
            .expect("publish should succeed");
    }

    let mut received = Vec::new();
    while received.len() < 5 {
        let n = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("delivery should arrive")
            .expect("channel open");
        received.push(n);
    }
    assert_eq!(received, vec![0, 1, 2, 3, 4]);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_exclusive_consumer_and_consumer_count() {
    let (_container, url) = start_rabbitmq().await;

    let registry = Arc::new(QueueRegistry::new());
    registry
        .add_direct_queue(DirectQueue::new(
            binding("it_exclusive"),
            direct_handler_fn(|_| async { Ok(()) }),
        ))
        .await;
    let manager = started_manager(&url, registry).await;

    let other = AmqpBroker::new(AmqpConfig::new(url.as_str()))
        .connect()
        .await
        .expect("second session should connect");

    let second = other.consume(&binding("it_exclusive"), true).await;
    assert!(matches!(second, Err(BusError::Subscribe(_))));

    assert_eq!(other.consumer_count("it_exclusive").await.unwrap(), 1);
    assert_eq!(other.consumer_count("it_nobody_home").await.unwrap(), 0);

    manager.shutdown().await;
}
