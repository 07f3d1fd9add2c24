//! Stale host sweep.
//!
//! Runs beside the consumer. Both only ever move a server's `last_seen`
//! forward or mark it offline, so the two writers need no coordination
//! beyond the single-statement updates in the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use manman_events::{ExternalEvent, ExternalHostEvent};
use manman_id::ServerId;
use manman_store::{DbError, Server};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::external::ExternalPublisher;
use crate::store::ProcessorStore;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
    /// A server not seen for this long is stale.
    pub threshold: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            threshold: Duration::from_secs(10),
        }
    }
}

pub struct StaleSweeper {
    store: Arc<dyn ProcessorStore>,
    external: ExternalPublisher,
    config: SweepConfig,
}

impl StaleSweeper {
    pub fn new(
        store: Arc<dyn ProcessorStore>,
        external: ExternalPublisher,
        config: SweepConfig,
    ) -> Self {
        Self {
            store,
            external,
            config,
        }
    }

    #[instrument(skip(self, shutdown), name = "stale_sweep")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            threshold_secs = self.config.threshold.as_secs(),
            "Starting stale host sweep"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Stale host sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Stale host sweep shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Marks every stale online server offline and emits one stale event for
    /// each server this pass actually changed.
    pub async fn sweep_once(&self) -> Result<Vec<Server>, DbError> {
        let stale = self.store.list_stale_servers(self.config.threshold).await?;
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<ServerId> = stale.iter().map(|s| s.id).collect();
        let marked = self.store.mark_servers_offline(&ids).await?;

        for server in &marked {
            warn!(
                server_id = %server.id,
                name = %server.name,
                last_seen = ?server.last_seen,
                "Host is stale, marked offline"
            );
            self.external
                .publish(&ExternalEvent::HostStale(ExternalHostEvent {
                    server_id: server.id,
                    name: server.name.clone(),
                    status: server.status,
                    last_seen: server.last_seen,
                    occurred_at: Utc::now(),
                }))
                .await;
        }

        if !marked.is_empty() {
            info!(count = marked.len(), "Stale host sweep complete");
        }
        Ok(marked)
    }
}
