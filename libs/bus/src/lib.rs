//! # manman-bus
//!
//! Topic-exchange plumbing shared by the host manager and the event processor.
//!
//! - [`topic::matches`] implements AMQP topic matching for handler dispatch
//! - [`Publisher`] publishes to a topic exchange; [`AmqpPublisher`] reconnects
//!   with backoff, [`MemoryPublisher`] records messages for tests
//! - [`Consumer`] drives a [`DeliveryHandler`] with bounded prefetch, acks or
//!   requeues by [`HandlerError`] kind, and drains in-flight work on shutdown

mod backoff;
mod consumer;
mod error;
mod publisher;
pub mod topic;

pub use backoff::BackoffPolicy;
pub use consumer::{disposition, Consumer, ConsumerConfig, DeliveryHandler, Disposition};
pub use error::{BusError, HandlerError};
pub use publisher::{publish_json, AmqpPublisher, MemoryPublisher, PublishedMessage, Publisher};

/// Opens an AMQP connection driven by the tokio runtime.
pub async fn connect(url: &str) -> Result<lapin::Connection, BusError> {
    let properties = lapin::ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio);

    lapin::Connection::connect(url, properties)
        .await
        .map_err(|e| BusError::Connection(e.to_string()))
}

/// Declares a durable topic exchange.
pub async fn declare_topic_exchange(channel: &lapin::Channel, name: &str) -> Result<(), BusError> {
    channel
        .exchange_declare(
            name,
            lapin::ExchangeKind::Topic,
            lapin::options::ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            lapin::types::FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Channel(e.to_string()))
}
