//! c2mesh-core: broker bring-up and callback graph host
//!
//! Opens the configured store, registers the graph queues, waits for the
//! broker, starts every listener and then supervises the broker session
//! until Ctrl+C.
//!
//! ## Configuration
//! ```yaml
//! messaging:
//!   type: amqp
//!   amqp:
//!     url: amqp://rabbitmq:5672
//!   retry_delay_ms: 1000
//!   reconnect: true
//!
//! storage:
//!   type: postgres
//!   postgres:
//!     uri: postgres://c2mesh:c2mesh@db:5432/c2mesh
//!
//! startup:
//!   notification_delay_secs: 30
//!
//! health:
//!   interval_secs: 10
//!   container_queues: [http_container, smb_container]
//! ```

use std::sync::Arc;

use tracing::{error, info};

use c2mesh::bus::{Broker, MockBroker};
use c2mesh::config::{Config, MessagingType};
use c2mesh::context::CoreContext;
use c2mesh::handlers::register_graph_queues;
use c2mesh::orchestration::Orchestrator;
use c2mesh::storage::init_storage;
use c2mesh::utils::bootstrap::{init_tracing, parse_config_path};

fn select_broker(config: &Config) -> Result<Arc<dyn Broker>, Box<dyn std::error::Error>> {
    match config.messaging.messaging_type {
        #[cfg(feature = "amqp")]
        MessagingType::Amqp => {
            use c2mesh::bus::{AmqpBroker, AmqpConfig};
            Ok(Arc::new(AmqpBroker::new(AmqpConfig::new(
                config.messaging.amqp.url.clone(),
            ))))
        }
        MessagingType::Memory => {
            info!("Using in-memory broker");
            Ok(Arc::new(MockBroker::new()))
        }
        #[allow(unreachable_patterns)]
        _ => Err("amqp feature not enabled".into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    let stores = init_storage(&config.storage).await?;
    let broker = select_broker(&config)?;

    let ctx = CoreContext::new(config, broker, stores);
    register_graph_queues(&ctx.registry, &ctx.graph, ctx.exchange()).await;

    let orchestrator = Orchestrator::new(ctx);
    let report = orchestrator.bring_up().await?;
    info!(
        listeners = report.listeners.total(),
        edges = report.edges,
        "c2mesh-core running, press Ctrl+C to exit"
    );

    let outcome: Result<(), Box<dyn std::error::Error>> = tokio::select! {
        result = orchestrator.supervise() => result.map_err(Into::into),
        signal = tokio::signal::ctrl_c() => signal.map_err(Into::into),
    };

    orchestrator.shutdown().await;
    outcome
}
