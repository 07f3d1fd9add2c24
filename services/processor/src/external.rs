//! Best-effort republishing to the external exchange.

use std::sync::Arc;

use manman_bus::Publisher;
use manman_events::ExternalEvent;
use tracing::{debug, warn};

/// Publishes sanitized events for downstream consumers.
///
/// Failures are logged and dropped; they never affect the internal state
/// change that produced the event.
#[derive(Clone)]
pub struct ExternalPublisher {
    publisher: Arc<dyn Publisher>,
    exchange: String,
}

impl ExternalPublisher {
    pub fn new(publisher: Arc<dyn Publisher>, exchange: impl Into<String>) -> Self {
        Self {
            publisher,
            exchange: exchange.into(),
        }
    }

    /// Returns true if the broker accepted the event.
    pub async fn publish(&self, event: &ExternalEvent) -> bool {
        let routing_key = event.routing_key();
        let body = match event.to_json() {
            Ok(body) => body,
            Err(e) => {
                warn!(routing_key, error = %e, "Failed to encode external event");
                return false;
            }
        };

        match self.publisher.publish(&self.exchange, &routing_key, body).await {
            Ok(()) => {
                debug!(routing_key, "Published external event");
                true
            }
            Err(e) => {
                warn!(routing_key, error = %e, "Failed to publish external event, dropping");
                false
            }
        }
    }
}
