//! Host status and heartbeat handlers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use manman_bus::HandlerError;
use manman_events::{
    decode, ExternalEvent, ExternalHostEvent, HealthUpdate, HostStatusUpdate, ServerStatus,
};
use manman_id::ServerId;
use manman_store::{Server, ServerStatusChange};
use tracing::{debug, info, instrument, warn};

use super::{storage_error, EventHandler};
use crate::external::ExternalPublisher;
use crate::store::ProcessorStore;

fn host_event(server: &Server) -> ExternalEvent {
    ExternalEvent::Host(ExternalHostEvent {
        server_id: server.id,
        name: server.name.clone(),
        status: server.status,
        last_seen: server.last_seen,
        occurred_at: Utc::now(),
    })
}

async fn record_seen(
    store: &dyn ProcessorStore,
    server_id: ServerId,
    status: ServerStatus,
) -> Result<ServerStatusChange, HandlerError> {
    store
        .update_server_seen(server_id, status, Utc::now())
        .await
        .map_err(storage_error)?
        .ok_or_else(|| HandlerError::permanent(format!("server {server_id} not found")))
}

/// Applies `HostStatusUpdate`s published on startup and shutdown.
pub struct HostStatusHandler {
    pattern: &'static str,
    store: Arc<dyn ProcessorStore>,
    external: ExternalPublisher,
}

impl HostStatusHandler {
    pub fn new(
        pattern: &'static str,
        store: Arc<dyn ProcessorStore>,
        external: ExternalPublisher,
    ) -> Self {
        Self {
            pattern,
            store,
            external,
        }
    }
}

#[async_trait]
impl EventHandler for HostStatusHandler {
    fn name(&self) -> &'static str {
        "host_status"
    }

    fn pattern(&self) -> &'static str {
        self.pattern
    }

    #[instrument(skip(self, body))]
    async fn handle(&self, routing_key: &str, body: &[u8]) -> Result<(), HandlerError> {
        let update: HostStatusUpdate = decode(body)?;
        let change = record_seen(self.store.as_ref(), update.server_id, update.status).await?;

        if change.previous == change.server.status {
            debug!(server_id = %update.server_id, status = %update.status, "Host status unchanged");
            return Ok(());
        }

        info!(
            server_id = %update.server_id,
            from = %change.previous,
            to = %change.server.status,
            "Host status changed"
        );
        self.external.publish(&host_event(&change.server)).await;
        Ok(())
    }
}

/// Applies heartbeats: refreshes `last_seen` and brings offline hosts back.
pub struct HealthHandler {
    pattern: &'static str,
    store: Arc<dyn ProcessorStore>,
    external: ExternalPublisher,
}

impl HealthHandler {
    pub fn new(
        pattern: &'static str,
        store: Arc<dyn ProcessorStore>,
        external: ExternalPublisher,
    ) -> Self {
        Self {
            pattern,
            store,
            external,
        }
    }
}

#[async_trait]
impl EventHandler for HealthHandler {
    fn name(&self) -> &'static str {
        "health"
    }

    fn pattern(&self) -> &'static str {
        self.pattern
    }

    async fn handle(&self, _routing_key: &str, body: &[u8]) -> Result<(), HandlerError> {
        let update: HealthUpdate = decode(body)?;
        let server_id = update.server_id;

        if let Some(stats) = &update.session_stats {
            debug!(
                %server_id,
                total = stats.total,
                running = stats.running,
                starting = stats.starting,
                "Heartbeat"
            );
            if stats.stuck_starting > 0 {
                warn!(
                    %server_id,
                    stuck_starting = stats.stuck_starting,
                    "Host reports sessions stuck in starting"
                );
            }
        }

        let change = record_seen(self.store.as_ref(), server_id, ServerStatus::Online).await?;
        if change.previous == ServerStatus::Offline {
            info!(%server_id, "Heartbeat from offline host, marking online");
            self.external.publish(&host_event(&change.server)).await;
        }
        Ok(())
    }
}
