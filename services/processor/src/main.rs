//! manman Event Processor
//!
//! A single logical consumer of the internal exchange. Prefetch is 1 so
//! status transitions are applied in queue order; the stale sweep runs on
//! its own task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use manman_bus::{AmqpPublisher, Consumer, ConsumerConfig};
use manman_events::routing::PROCESSOR_BINDINGS;
use manman_processor::config::Config;
use manman_processor::{ExternalPublisher, HandlerRegistry, PgStore, StaleSweeper, SweepConfig};
use manman_store::Database;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting manman event processor");
    info!(
        queue = %config.queue,
        internal_exchange = %config.internal_exchange,
        external_exchange = %config.external_exchange,
        stale_threshold_secs = config.stale_threshold.as_secs(),
        "Configuration loaded"
    );

    let db = Database::connect(&config.db)
        .await
        .context("connecting to database")?;
    if config.dev_mode {
        db.run_migrations().await.context("running migrations")?;
    }
    let store = Arc::new(PgStore::new(db));

    let publisher = Arc::new(AmqpPublisher::new(
        config.rabbitmq_url.clone(),
        vec![config.internal_exchange.clone(), config.external_exchange.clone()],
    ));
    let external = ExternalPublisher::new(publisher.clone(), config.external_exchange.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = StaleSweeper::new(
        store.clone(),
        external.clone(),
        SweepConfig {
            interval: config.sweep_interval,
            threshold: config.stale_threshold,
        },
    );
    let sweep_shutdown = shutdown_rx.clone();
    let sweep_handle = tokio::spawn(async move { sweeper.run(sweep_shutdown).await });

    let mut consumer_config = ConsumerConfig::new(
        config.rabbitmq_url.clone(),
        config.internal_exchange.clone(),
        config.queue.clone(),
    );
    for pattern in PROCESSOR_BINDINGS {
        consumer_config = consumer_config.bind(pattern);
    }
    consumer_config.prefetch = 1;
    consumer_config.concurrency = 1;
    consumer_config.drain_timeout = config.shutdown_timeout;

    let registry = Arc::new(HandlerRegistry::new(store, external));
    info!(handlers = ?registry.handler_names(), "Handlers registered");

    let consumer = Consumer::new(consumer_config, registry);
    let mut consumer_handle = tokio::spawn(consumer.run(shutdown_rx));

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    let consumer_finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => { info!("Received SIGINT"); false }
        _ = sigterm.recv() => { info!("Received SIGTERM"); false }
        result = &mut consumer_handle => {
            match result {
                Ok(Ok(())) => info!("Consumer exited"),
                Ok(Err(e)) => error!(error = %e, "Consumer failed"),
                Err(e) => error!(error = %e, "Consumer panicked"),
            }
            true
        }
    };

    let _ = shutdown_tx.send(true);
    if !consumer_finished {
        let drain = config.shutdown_timeout + Duration::from_secs(5);
        if tokio::time::timeout(drain, &mut consumer_handle).await.is_err() {
            warn!("Consumer did not drain in time, aborting");
            consumer_handle.abort();
        }
    }
    let _ = sweep_handle.await;

    publisher.close().await;
    info!("Event processor shutdown complete");
    Ok(())
}
