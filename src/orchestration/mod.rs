//! Bring-up sequencing and connection supervision.
//!
//! Bring-up blocks until the broker is reachable, rebuilds the callback graph
//! from storage, seals the queue registry by starting every listener, and
//! finally schedules the delayed startup notifications. `supervise` then
//! watches the broker session for the life of the process.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::{BusError, ListenerSummary};
use crate::context::CoreContext;
use crate::graph::GraphError;
use crate::notify::{schedule_startup_messages, BrokerNotifier, Notifier};


/// Errors that abort bring-up or end supervision.
#[derive(Debug, thiserror::Error)]
pub enum BringUpError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("broker connection lost")]
    ConnectionLost,
}

/// What one bring-up started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BringUpReport {
    pub listeners: ListenerSummary,
    /// Active edges loaded into the callback graph.
    pub edges: usize,
}

/// Drives bring-up and reconnects for one core.
pub struct Orchestrator {
    ctx: CoreContext,
    notifier: Arc<dyn Notifier>,
    startup_messages: Mutex<Option<JoinHandle<usize>>>,
}

impl Orchestrator {
    /// Orchestrator publishing startup messages through the broker.
    pub fn new(ctx: CoreContext) -> Self {
        let webhook = &ctx.config.startup.webhook;
        let notifier = Arc::new(BrokerNotifier::new(
            Arc::clone(&ctx.connections),
            webhook.exchange.clone(),
            webhook.routing_key.clone(),
        ));
        Self::with_notifier(ctx, notifier)
    }

    pub fn with_notifier(ctx: CoreContext, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            ctx,
            notifier,
            startup_messages: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &CoreContext {
        &self.ctx
    }

    /// Bring the core online.
    ///
    /// Blocks until the broker accepts a connection. Queue registration must
    /// be complete before this is called; anything registered later is never
    /// consumed. A queue the broker refuses to bind aborts bring-up.
    pub async fn bring_up(&self) -> Result<BringUpReport, BringUpError> {
        self.ctx.connections.ensure_connected().await;

        let edges = self.ctx.graph.rehydrate().await.map_err(|e| {
            error!(error = %e, "Failed to rehydrate callback graph");
            e
        })?;

        let listeners = self.ctx.connections.start_all().await.map_err(|e| {
            error!(error = %e, "Failed to start listeners");
            e
        })?;

        let handle = schedule_startup_messages(
            Arc::clone(&self.ctx.operations),
            Arc::clone(&self.notifier),
            self.ctx.config.startup.clone(),
        );
        *self.startup_messages.lock().await = Some(handle);

        info!(
            listeners = listeners.total(),
            edges,
            "Bring-up complete"
        );

        Ok(BringUpReport { listeners, edges })
    }

    /// Wait for the scheduled startup messages and return how many were sent.
    ///
    /// Returns `None` if bring-up has not scheduled them or they were already
    /// awaited.
    pub async fn startup_messages_sent(&self) -> Option<usize> {
        let handle = self.startup_messages.lock().await.take()?;
        match handle.await {
            Ok(sent) => Some(sent),
            Err(e) => {
                warn!(error = %e, "Startup message task did not finish");
                None
            }
        }
    }

    /// Watch the broker session until it is lost for good.
    ///
    /// With `messaging.reconnect` enabled, each lost session is replaced by a
    /// new one, the callback graph is reconciled with storage, and every
    /// sealed queue gets a fresh listener; this never returns `Ok`. With it
    /// disabled, the first lost session ends supervision with
    /// `ConnectionLost`.
    pub async fn supervise(&self) -> Result<(), BringUpError> {
        loop {
            if let Ok(connection) = self.ctx.connections.connection().await {
                connection.closed().await;
            }
            warn!("Broker connection lost");

            if !self.ctx.config.messaging.reconnect {
                self.ctx.connections.shutdown().await;
                return Err(BringUpError::ConnectionLost);
            }

            self.reconnect().await?;
        }
    }

    async fn reconnect(&self) -> Result<ListenerSummary, BringUpError> {
        self.ctx.connections.ensure_connected().await;

        if let Err(e) = self.ctx.graph.rehydrate().await {
            warn!(error = %e, "Failed to rehydrate callback graph after reconnect, keeping previous state");
        }

        let listeners = self.ctx.connections.respawn_listeners().await?;
        info!(listeners = listeners.total(), "Listeners respawned after reconnect");
        Ok(listeners)
    }

    /// Stop every listener and the pending startup messages.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.startup_messages.lock().await.take() {
            handle.abort();
        }
        self.ctx.connections.shutdown().await;
        info!("Core stopped");
    }
}
