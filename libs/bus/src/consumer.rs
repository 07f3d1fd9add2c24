//! Queue consumer with bounded prefetch, reconnect and drain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::{BusError, HandlerError};

/// Handles one delivery. Implementations must be idempotent: a message that
/// was handled but not acknowledged before a disconnect is delivered again.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, routing_key: &str, body: &[u8]) -> Result<(), HandlerError>;
}

/// What to tell the broker about a handled delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
}

/// Maps a handler outcome to an ack decision.
pub fn disposition(result: &Result<(), HandlerError>) -> Disposition {
    match result {
        Ok(()) | Err(HandlerError::Permanent(_)) => Disposition::Ack,
        Err(HandlerError::Transient(_)) => Disposition::Requeue,
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub url: String,
    pub exchange: String,
    pub queue: String,
    pub bindings: Vec<String>,
    /// Broker-side limit of unacknowledged deliveries.
    pub prefetch: u16,
    /// Deliveries handled at once. Ordering is only preserved when this is 1.
    pub concurrency: usize,
    /// Exclusive auto-delete queue instead of a durable one.
    pub exclusive: bool,
    pub backoff: BackoffPolicy,
    pub drain_timeout: Duration,
}

impl ConsumerConfig {
    pub fn new(url: impl Into<String>, exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange: exchange.into(),
            queue: queue.into(),
            bindings: Vec::new(),
            prefetch: 1,
            concurrency: 1,
            exclusive: false,
            backoff: BackoffPolicy::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }

    pub fn bind(mut self, pattern: impl Into<String>) -> Self {
        self.bindings.push(pattern.into());
        self
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Consumes one queue until shutdown.
pub struct Consumer<H> {
    config: ConsumerConfig,
    handler: Arc<H>,
}

impl<H: DeliveryHandler> Consumer<H> {
    pub fn new(config: ConsumerConfig, handler: Arc<H>) -> Self {
        Self { config, handler }
    }

    /// Runs until `shutdown` flips to true, reconnecting with backoff
    /// whenever the connection is lost.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), BusError> {
        let mut attempt = 0u32;

        info!(
            queue = %self.config.queue,
            bindings = ?self.config.bindings,
            prefetch = self.config.prefetch,
            "Starting consumer"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.consume(&mut shutdown, &mut attempt).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Lost(reason)) => {
                    warn!(queue = %self.config.queue, reason = %reason, "Consumer connection lost");
                }
                Err(e) => {
                    warn!(queue = %self.config.queue, error = %e, attempt, "Consumer connect failed");
                }
            }

            let delay = self.config.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!(queue = %self.config.queue, "Consumer stopped");
        Ok(())
    }

    async fn consume(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        attempt: &mut u32,
    ) -> Result<SessionEnd, BusError> {
        let cfg = &self.config;
        let connection = crate::connect(&cfg.url).await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Channel(e.to_string()))?;

        channel
            .basic_qos(cfg.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Channel(e.to_string()))?;
        crate::declare_topic_exchange(&channel, &cfg.exchange).await?;

        let queue_options = if cfg.exclusive {
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..Default::default()
            }
        } else {
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            }
        };
        channel
            .queue_declare(&cfg.queue, queue_options, FieldTable::default())
            .await
            .map_err(|e| BusError::Channel(e.to_string()))?;

        for pattern in &cfg.bindings {
            channel
                .queue_bind(
                    &cfg.queue,
                    &cfg.exchange,
                    pattern,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Channel(e.to_string()))?;
        }

        let mut deliveries = channel
            .basic_consume(
                &cfg.queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Channel(e.to_string()))?;

        *attempt = 0;
        info!(queue = %cfg.queue, "Consumer connected");

        let permits = Arc::new(Semaphore::new(cfg.concurrency.max(1)));
        let mut in_flight = JoinSet::new();

        let end = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break SessionEnd::Shutdown;
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Delivery task panicked");
                    }
                }
                next = deliveries.next() => {
                    let delivery = match next {
                        Some(Ok(delivery)) => delivery,
                        Some(Err(e)) => break SessionEnd::Lost(e.to_string()),
                        None => break SessionEnd::Lost("consumer stream closed".to_string()),
                    };

                    let permit = tokio::select! {
                        permit = permits.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break SessionEnd::Shutdown,
                        },
                        _ = shutdown.changed() => {
                            // Not acked, so the broker redelivers it.
                            break SessionEnd::Shutdown;
                        }
                    };

                    let handler = self.handler.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        handle_delivery(handler.as_ref(), delivery).await;
                    });
                }
            }
        };

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "Draining in-flight deliveries");
            let drained = tokio::time::timeout(cfg.drain_timeout, async {
                while in_flight.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    remaining = in_flight.len(),
                    timeout_secs = cfg.drain_timeout.as_secs(),
                    "Drain timed out, aborting in-flight deliveries"
                );
                in_flight.abort_all();
            }
        }

        let _ = channel.close(200, "consumer closing").await;
        let _ = connection.close(200, "consumer closing").await;
        Ok(end)
    }
}

async fn handle_delivery<H: DeliveryHandler + ?Sized>(handler: &H, delivery: Delivery) {
    let routing_key = delivery.routing_key.as_str().to_string();
    let result = handler.handle(&routing_key, &delivery.data).await;

    match &result {
        Ok(()) => debug!(routing_key = %routing_key, "Delivery handled"),
        Err(HandlerError::Permanent(reason)) => {
            warn!(routing_key = %routing_key, reason = %reason, "Dropping message after permanent failure");
        }
        Err(HandlerError::Transient(reason)) => {
            warn!(routing_key = %routing_key, reason = %reason, "Requeueing message after transient failure");
        }
    }

    let acked = match disposition(&result) {
        Disposition::Ack => delivery.acker.ack(BasicAckOptions::default()).await,
        Disposition::Requeue => {
            delivery
                .acker
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
        }
    };
    if let Err(e) = acked {
        warn!(routing_key = %routing_key, error = %e, "Failed to settle delivery");
    }
}
