//! Publishing to topic exchanges.

use std::sync::Mutex;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::{BasicProperties, Channel, Connection};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::BusError;

/// Publishes message bodies to a topic exchange.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>)
        -> Result<(), BusError>;
}

/// Serializes `message` as JSON and publishes it.
pub async fn publish_json<P, T>(
    publisher: &P,
    exchange: &str,
    routing_key: &str,
    message: &T,
) -> Result<(), BusError>
where
    P: Publisher + ?Sized,
    T: Serialize + Sync,
{
    let body = serde_json::to_vec(message)?;
    publisher.publish(exchange, routing_key, body).await
}

// =============================================================================
// AMQP
// =============================================================================

struct Link {
    connection: Connection,
    channel: Channel,
}

/// Publisher over a single confirm-mode channel.
///
/// The channel is opened lazily and reopened after any failure. Each publish
/// is retried with backoff up to `max_attempts` times; a message is only
/// considered sent once the broker confirms it.
pub struct AmqpPublisher {
    url: String,
    exchanges: Vec<String>,
    backoff: BackoffPolicy,
    max_attempts: u32,
    link: tokio::sync::Mutex<Option<Link>>,
}

impl AmqpPublisher {
    /// Creates a publisher that declares `exchanges` on every (re)connect.
    pub fn new(url: impl Into<String>, exchanges: Vec<String>) -> Self {
        Self {
            url: url.into(),
            exchanges,
            backoff: BackoffPolicy::default(),
            max_attempts: 5,
            link: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_retry(mut self, backoff: BackoffPolicy, max_attempts: u32) -> Self {
        self.backoff = backoff;
        self.max_attempts = max_attempts.max(1);
        self
    }

    async fn open(&self) -> Result<Link, BusError> {
        let connection = crate::connect(&self.url).await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Channel(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Channel(e.to_string()))?;
        for exchange in &self.exchanges {
            crate::declare_topic_exchange(&channel, exchange).await?;
        }
        info!(exchanges = ?self.exchanges, "Publisher connected");
        Ok(Link {
            connection,
            channel,
        })
    }

    async fn try_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BusError> {
        let mut guard = self.link.lock().await;
        let stale = guard
            .as_ref()
            .map(|l| !l.channel.status().connected() || !l.connection.status().connected())
            .unwrap_or(true);
        if stale {
            *guard = Some(self.open().await?);
        }
        let Some(link) = guard.as_ref() else {
            return Err(BusError::Connection("no channel".to_string()));
        };

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);

        let result = async {
            let confirm = link
                .channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    body,
                    properties,
                )
                .await
                .map_err(|e| BusError::Publish(e.to_string()))?
                .await
                .map_err(|e| BusError::Publish(e.to_string()))?;
            if confirm.is_nack() {
                return Err(BusError::NotConfirmed);
            }
            Ok(())
        }
        .await;

        if result.is_err() {
            *guard = None;
        }
        result
    }

    /// Closes the channel and connection, if open.
    pub async fn close(&self) {
        if let Some(link) = self.link.lock().await.take() {
            let _ = link.channel.close(200, "shutdown").await;
            let _ = link.connection.close(200, "shutdown").await;
        }
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<(), BusError> {
        let mut attempt = 0;
        loop {
            match self.try_publish(exchange, routing_key, &body).await {
                Ok(()) => {
                    debug!(exchange, routing_key, "Published");
                    return Ok(());
                }
                Err(e) if attempt + 1 >= self.max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        exchange,
                        routing_key,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

impl PublishedMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

/// Publisher that records messages in memory.
#[derive(Default)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<PublishedMessage>>,
    /// Publishes left before failing; `None` never fails.
    budget: Mutex<Option<usize>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent publish fail until reset.
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut b) = self.budget.lock() {
            *b = failing.then_some(0);
        }
    }

    /// Lets the next `successes` publishes through, then fails every one
    /// after them until reset.
    pub fn fail_after(&self, successes: usize) {
        if let Ok(mut b) = self.budget.lock() {
            *b = Some(successes);
        }
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Messages published to `exchange`, in order.
    pub fn on_exchange(&self, exchange: &str) -> Vec<PublishedMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.exchange == exchange)
            .collect()
    }

    /// Routing keys of every published message, in order.
    pub fn routing_keys(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .map(|m| m.routing_key)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut m) = self.messages.lock() {
            m.clear();
        }
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<(), BusError> {
        {
            let mut budget = self.budget.lock().unwrap_or_else(|e| e.into_inner());
            match budget.as_mut() {
                Some(0) => {
                    return Err(BusError::Publish("memory publisher set to fail".to_string()))
                }
                Some(left) => *left -= 1,
                None => {}
            }
        }
        let mut messages = self
            .messages
            .lock()
            .map_err(|_| BusError::Publish("poisoned".to_string()))?;
        messages.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_publisher_records_in_order() {
        let publisher = MemoryPublisher::new();
        publish_json(&publisher, "manman", "status.host.1", &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        publisher
            .publish("manman.external", "manman.host.online", b"{}".to_vec())
            .await
            .unwrap();

        assert_eq!(
            publisher.routing_keys(),
            vec!["status.host.1", "manman.host.online"]
        );
        assert_eq!(publisher.on_exchange("manman")[0].json()["a"], 1);
    }

    #[tokio::test]
    async fn test_memory_publisher_failure_mode() {
        let publisher = MemoryPublisher::new();
        publisher.set_failing(true);
        assert!(publisher.publish("x", "y", vec![]).await.is_err());
        assert!(publisher.messages().is_empty());

        publisher.set_failing(false);
        assert!(publisher.publish("x", "y", vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_publisher_fails_after_budget() {
        let publisher = MemoryPublisher::new();
        publisher.fail_after(1);
        assert!(publisher.publish("x", "first", vec![]).await.is_ok());
        assert!(publisher.publish("x", "second", vec![]).await.is_err());
        assert_eq!(publisher.routing_keys(), vec!["first"]);
    }
}
