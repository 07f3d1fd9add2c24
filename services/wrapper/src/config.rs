//! Wrapper configuration.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// gRPC listen address.
    pub listen_addr: SocketAddr,

    /// Grace period given to the game when the wrapper itself is stopped.
    pub shutdown_timeout: Duration,

    /// Output chunks buffered per subscriber before the oldest are dropped.
    pub output_buffer: usize,

    /// Log level filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("WRAPPER_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:50051".to_string())
            .parse()
            .context("WRAPPER_LISTEN_ADDR is not a socket address")?;

        let shutdown_timeout_secs = std::env::var("WRAPPER_SHUTDOWN_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let output_buffer = std::env::var("WRAPPER_OUTPUT_BUFFER")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(1024);

        let log_level = std::env::var("WRAPPER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            shutdown_timeout: Duration::from_secs(shutdown_timeout_secs),
            output_buffer,
            log_level,
        })
    }
}
