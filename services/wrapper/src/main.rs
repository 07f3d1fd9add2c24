//! manman wrapper
//!
//! Runs as the entrypoint of a session container and supervises the game
//! process on behalf of the host manager.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use manman_proto::wrapper::v1::WrapperControlServer;
use manman_wrapper::config::Config;
use manman_wrapper::{ProcessSupervisor, WrapperService};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

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

    info!(
        listen_addr = %config.listen_addr,
        output_buffer = config.output_buffer,
        "Starting manman wrapper"
    );

    let supervisor = Arc::new(ProcessSupervisor::new(config.output_buffer));
    let service = WrapperService::new(Arc::clone(&supervisor));

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let addr = config.listen_addr;
    let mut server = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(WrapperControlServer::new(service))
            .serve_with_shutdown(addr, async move {
                let _ = shutdown_rx.changed().await;
            })
            .await
    });

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
        result = &mut server => {
            match result {
                Ok(Ok(())) => info!("gRPC server exited"),
                Ok(Err(e)) => error!(error = %e, "gRPC server failed"),
                Err(e) => error!(error = %e, "gRPC server task panicked"),
            }
            supervisor.stop(true, config.shutdown_timeout).await?;
            return Ok(());
        }
    }

    // The game goes down before the API so the final status is still observable.
    match supervisor.stop(true, config.shutdown_timeout).await {
        Ok(status) => info!(state = ?status.state, exit_code = ?status.exit_code, "Game process stopped"),
        Err(e) => warn!(error = %e, "Failed to stop game process"),
    }

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, &mut server).await {
        Ok(_) => info!("Wrapper shutdown complete"),
        Err(_) => {
            warn!("gRPC server did not drain in time, aborting");
            server.abort();
        }
    }

    Ok(())
}
