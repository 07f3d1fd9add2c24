//! Heartbeat loop publishing `HealthUpdate` with session counts.

use std::sync::Arc;
use std::time::Duration;

use manman_bus::{publish_json, Publisher};
use manman_events::routing;
use manman_events::HealthUpdate;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::session::SessionManager;

/// Publishes one heartbeat.
pub async fn beat(
    sessions: &SessionManager,
    publisher: &dyn Publisher,
    exchange: &str,
) -> anyhow::Result<HealthUpdate> {
    if let Err(e) = sessions.prune() {
        warn!(error = %e, "Failed to prune finished sessions");
    }

    let stats = sessions.stats()?;
    if stats.stuck_starting > 0 {
        warn!(stuck_starting = stats.stuck_starting, "Sessions stuck in starting");
    }

    let update = HealthUpdate {
        server_id: sessions.server_id(),
        session_stats: Some(stats),
    };
    publish_json(
        publisher,
        exchange,
        &routing::health(sessions.server_id()),
        &update,
    )
    .await?;
    Ok(update)
}

/// Run the heartbeat loop until shutdown.
pub async fn run_heartbeat_loop(
    sessions: Arc<SessionManager>,
    publisher: Arc<dyn Publisher>,
    exchange: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        server_id = %sessions.server_id(),
        interval_secs = interval.as_secs(),
        "Starting heartbeat loop"
    );

    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                match beat(&sessions, publisher.as_ref(), &exchange).await {
                    Ok(update) => {
                        consecutive_failures = 0;
                        debug!(stats = ?update.session_stats, "Heartbeat published");
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(error = %e, consecutive_failures, "Heartbeat failed");
                        } else {
                            error!(error = %e, consecutive_failures, "Heartbeat failed repeatedly");
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }
}
