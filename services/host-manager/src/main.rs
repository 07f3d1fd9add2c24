//! manman Host Manager
//!
//! Runs on each game host and owns the Docker containers of its sessions.
//!
//! Startup order matters: the host registers first (so it knows its server
//! id), reconciles the local snapshot with Docker, announces itself online,
//! and only then starts consuming commands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use manman_bus::{publish_json, AmqpPublisher, Consumer, ConsumerConfig, Publisher};
use manman_events::routing;
use manman_events::{HostStatusUpdate, ServerStatus};
use manman_host_manager::config::Config;
use manman_host_manager::control_plane::{self, GrpcControlPlane};
use manman_host_manager::heartbeat;
use manman_host_manager::{
    Collaborators, CommandHandler, DockerRuntime, FsBlobStore, GrpcWrapperClient,
    SessionManager, SessionSettings, StateStore,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const REGISTRATION_ATTEMPTS: u32 = 10;
const API_TIMEOUT: Duration = Duration::from_secs(10);

async fn publish_host_status(
    publisher: &dyn Publisher,
    exchange: &str,
    update: &HostStatusUpdate,
) {
    let key = routing::host_status(update.server_id);
    match publish_json(publisher, exchange, &key, update).await {
        Ok(()) => info!(status = %update.status, "Published host status"),
        Err(e) => error!(error = %e, status = %update.status, "Failed to publish host status"),
    }
}

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

    info!("Starting manman host manager");
    info!(
        environment = %config.environment,
        api_address = %config.api_address,
        data_dir = %config.data_dir.display(),
        "Configuration loaded"
    );

    let runtime = Arc::new(DockerRuntime::connect(config.docker_timeout).context("connecting to Docker")?);
    let control_plane = Arc::new(GrpcControlPlane::new(&config.api_address, API_TIMEOUT)?);

    let name = control_plane::server_name(config.server_name.as_deref(), &config.environment);
    let registration = control_plane::register(
        control_plane.as_ref(),
        runtime.as_ref(),
        &name,
        &config.environment,
        REGISTRATION_ATTEMPTS,
    )
    .await?;
    let server_id = registration.server_id;

    let state = Arc::new(StateStore::load(config.state_path()).context("loading session snapshot")?);
    state.set_server_id(server_id)?;

    let publisher: Arc<AmqpPublisher> = Arc::new(AmqpPublisher::new(
        config.rabbitmq_url.clone(),
        vec![config.internal_exchange.clone(), config.external_exchange.clone()],
    ));

    let sessions = Arc::new(SessionManager::new(
        server_id,
        config.internal_exchange.clone(),
        SessionSettings::from_config(&config),
        Collaborators {
            runtime: runtime.clone(),
            wrappers: Arc::new(GrpcWrapperClient::new(API_TIMEOUT)),
            publisher: publisher.clone(),
            control_plane: control_plane.clone(),
            blobs: Arc::new(FsBlobStore::new(config.blob_dir())),
            state,
        },
    ));

    match sessions.recover().await {
        Ok(report) => info!(?report, "Reconciled local state with Docker"),
        Err(e) => warn!(error = %e, "Recovery incomplete"),
    }

    let online = HostStatusUpdate {
        server_id,
        status: ServerStatus::Online,
    };
    publish_host_status(publisher.as_ref(), &config.internal_exchange, &online).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let heartbeat_handle = tokio::spawn(heartbeat::run_heartbeat_loop(
        Arc::clone(&sessions),
        publisher.clone(),
        config.internal_exchange.clone(),
        config.heartbeat_interval,
        shutdown_rx.clone(),
    ));

    let mut consumer_config = ConsumerConfig::new(
        config.rabbitmq_url.clone(),
        config.internal_exchange.clone(),
        format!("manman.host.{}", server_id),
    )
    .bind(routing::command_binding(server_id));
    consumer_config.prefetch = config.max_concurrent_commands;
    consumer_config.concurrency = usize::from(config.max_concurrent_commands);
    consumer_config.drain_timeout = config.shutdown_timeout;

    let consumer = Consumer::new(consumer_config, Arc::new(CommandHandler::new(Arc::clone(&sessions))));
    let mut consumer_handle = tokio::spawn(consumer.run(shutdown_rx));

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    let consumer_finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => { info!("Received SIGINT"); false }
        _ = sigterm.recv() => { info!("Received SIGTERM"); false }
        result = &mut consumer_handle => {
            match result {
                Ok(Ok(())) => info!("Command consumer exited"),
                Ok(Err(e)) => error!(error = %e, "Command consumer failed"),
                Err(e) => error!(error = %e, "Command consumer panicked"),
            }
            true
        }
    };

    // Stop taking commands, then let in-flight ones drain.
    let _ = shutdown_tx.send(true);
    if !consumer_finished {
        let drain = config.shutdown_timeout + Duration::from_secs(5);
        if tokio::time::timeout(drain, &mut consumer_handle).await.is_err() {
            warn!("Command consumer did not drain in time, aborting");
            consumer_handle.abort();
        }
    }
    let _ = heartbeat_handle.await;

    sessions.shutdown();

    let offline = HostStatusUpdate {
        server_id,
        status: ServerStatus::Offline,
    };
    publish_host_status(publisher.as_ref(), &config.internal_exchange, &offline).await;
    publisher.close().await;

    info!("Host manager shutdown complete");
    Ok(())
}
