//! Routing of internal-exchange messages to handlers.
//!
//! Each handler claims one topic pattern. A routing key must be claimed by
//! exactly one registered handler: a key nobody claims is unroutable and a
//! key claimed twice is ambiguous. Both are permanent failures, since no
//! redelivery can change which patterns match.

mod host;
mod session;

pub use host::{HealthHandler, HostStatusHandler};
pub use session::{decide, session_event, Decision, SessionStatusHandler, SessionWrite};

use std::sync::Arc;

use async_trait::async_trait;
use manman_bus::{topic, DeliveryHandler, HandlerError};
use manman_events::routing::PROCESSOR_BINDINGS;
use manman_store::DbError;
use tracing::{debug, warn};

use crate::external::ExternalPublisher;
use crate::store::ProcessorStore;

/// A handler for every message whose routing key matches [`pattern`](Self::pattern).
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// AMQP topic pattern this handler claims.
    fn pattern(&self) -> &'static str;

    async fn handle(&self, routing_key: &str, body: &[u8]) -> Result<(), HandlerError>;
}

/// Classifies a storage failure.
pub(crate) fn storage_error(err: DbError) -> HandlerError {
    if err.is_transient() {
        HandlerError::Transient(err.to_string())
    } else {
        HandlerError::Permanent(err.to_string())
    }
}

pub struct HandlerRegistry {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl HandlerRegistry {
    /// Registry with the session, host and health handlers.
    pub fn new(store: Arc<dyn ProcessorStore>, external: ExternalPublisher) -> Self {
        let [host_pattern, session_pattern, health_pattern] = PROCESSOR_BINDINGS;
        Self::empty()
            .register(HostStatusHandler::new(host_pattern, store.clone(), external.clone()))
            .register(SessionStatusHandler::new(
                session_pattern,
                store.clone(),
                external.clone(),
            ))
            .register(HealthHandler::new(health_pattern, store, external))
    }

    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Finds the single handler claiming `routing_key`.
    pub fn resolve(&self, routing_key: &str) -> Result<&dyn EventHandler, HandlerError> {
        let mut matching = self
            .handlers
            .iter()
            .filter(|h| topic::matches(h.pattern(), routing_key));

        let Some(first) = matching.next() else {
            return Err(HandlerError::permanent(format!(
                "no handler for routing key {routing_key}"
            )));
        };
        if let Some(second) = matching.next() {
            return Err(HandlerError::permanent(format!(
                "routing key {routing_key} claimed by both {} and {}",
                first.name(),
                second.name()
            )));
        }
        Ok(first.as_ref())
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }
}

#[async_trait]
impl DeliveryHandler for HandlerRegistry {
    async fn handle(&self, routing_key: &str, body: &[u8]) -> Result<(), HandlerError> {
        let handler = match self.resolve(routing_key) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(routing_key, error = %e, "Dropping unroutable message");
                return Err(e);
            }
        };
        debug!(routing_key, handler = handler.name(), "Dispatching message");
        handler.handle(routing_key, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manman_bus::MemoryPublisher;
    use rstest::rstest;

    use crate::store::MemoryStore;

    struct Named(&'static str, &'static str);

    #[async_trait]
    impl EventHandler for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn pattern(&self) -> &'static str {
            self.1
        }

        async fn handle(&self, _routing_key: &str, _body: &[u8]) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new(
            Arc::new(MemoryStore::new()),
            ExternalPublisher::new(Arc::new(MemoryPublisher::new()), "manman.external"),
        )
    }

    #[rstest]
    #[case("status.host.5", "host_status")]
    #[case("status.session.12", "session_status")]
    #[case("health.host.5", "health")]
    fn test_resolves_standard_keys(#[case] key: &str, #[case] expected: &str) {
        assert_eq!(registry().resolve(key).unwrap().name(), expected);
    }

    #[rstest]
    #[case("status.node.5")]
    #[case("cmd.host.1.session.start")]
    #[case("")]
    fn test_unroutable_key_is_permanent(#[case] key: &str) {
        let err = registry().resolve(key).err().unwrap();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_ambiguous_key_is_permanent() {
        let registry = HandlerRegistry::empty()
            .register(Named("all_status", "status.#"))
            .register(Named("host_status", "status.host.*"));

        assert_eq!(registry.resolve("status.session.1").unwrap().name(), "all_status");
        let err = registry.resolve("status.host.1").err().unwrap();
        assert!(err.is_permanent());
    }
}
