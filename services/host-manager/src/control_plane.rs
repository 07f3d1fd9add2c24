//! Calls into the control-plane API: self-registration and log references.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use manman_bus::BackoffPolicy;
use manman_id::{LogReferenceId, ServerId, SessionId};
use manman_proto::api::v1::{
    CreateLogReferenceRequest, ManManApiClient, RegisterServerRequest, ServerCapabilities,
};
use thiserror::Error;
use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn};

use crate::runtime::{ContainerRuntime, HostInfo};

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("invalid API address: {0}")]
    InvalidAddress(String),

    #[error("API call failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("API returned an invalid id: {0}")]
    InvalidId(i64),
}

/// Result of a registration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub server_id: ServerId,
    /// False when an existing server was matched by name.
    pub created: bool,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Registers this host by name, returning the existing id if the name is known.
    async fn register_server(
        &self,
        name: &str,
        environment: &str,
        info: &HostInfo,
    ) -> Result<Registration, ControlPlaneError>;

    async fn create_log_reference(
        &self,
        session_id: SessionId,
        blob_key: &str,
        size_bytes: u64,
    ) -> Result<LogReferenceId, ControlPlaneError>;
}

/// Stable server name: the explicit override, else `hostname-environment`.
pub fn server_name(explicit: Option<&str>, environment: &str) -> String {
    if let Some(name) = explicit.map(str::trim).filter(|n| !n.is_empty()) {
        return name.to_string();
    }

    let hostname = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}", hostname, environment)
}

/// Registers with the control plane, retrying until it answers.
pub async fn register(
    control_plane: &dyn ControlPlane,
    runtime: &dyn ContainerRuntime,
    name: &str,
    environment: &str,
    max_attempts: u32,
) -> anyhow::Result<Registration> {
    let info = match runtime.info().await {
        Ok(info) => info,
        Err(e) => {
            warn!(error = %e, "Could not read host capabilities");
            HostInfo::default()
        }
    };

    let backoff = BackoffPolicy::default();
    let mut attempt = 0;
    loop {
        match control_plane.register_server(name, environment, &info).await {
            Ok(registration) => {
                info!(
                    server_id = %registration.server_id,
                    name,
                    created = registration.created,
                    "Registered with control plane"
                );
                return Ok(registration);
            }
            Err(e) if attempt + 1 < max_attempts => {
                let delay = backoff.delay(attempt);
                warn!(error = %e, attempt, "Registration failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(anyhow::Error::new(e).context("registering with control plane")),
        }
    }
}

// =============================================================================
// gRPC
// =============================================================================

pub struct GrpcControlPlane {
    client: ManManApiClient<Channel>,
}

impl GrpcControlPlane {
    pub fn new(address: &str, timeout: Duration) -> Result<Self, ControlPlaneError> {
        let channel = Endpoint::from_shared(address.to_string())
            .map_err(|_| ControlPlaneError::InvalidAddress(address.to_string()))?
            .connect_timeout(timeout)
            .timeout(timeout)
            .connect_lazy();
        Ok(Self {
            client: ManManApiClient::new(channel),
        })
    }
}

#[async_trait]
impl ControlPlane for GrpcControlPlane {
    async fn register_server(
        &self,
        name: &str,
        environment: &str,
        info: &HostInfo,
    ) -> Result<Registration, ControlPlaneError> {
        let request = RegisterServerRequest {
            name: name.to_string(),
            environment: environment.to_string(),
            capabilities: Some(ServerCapabilities {
                cpu_cores: info.cpu_cores,
                memory_bytes: info.memory_bytes,
                docker_version: info.docker_version.clone(),
            }),
        };
        let response = self.client.clone().register_server(request).await?.into_inner();
        if response.server_id <= 0 {
            return Err(ControlPlaneError::InvalidId(response.server_id));
        }
        Ok(Registration {
            server_id: ServerId::new(response.server_id),
            created: response.created,
        })
    }

    async fn create_log_reference(
        &self,
        session_id: SessionId,
        blob_key: &str,
        size_bytes: u64,
    ) -> Result<LogReferenceId, ControlPlaneError> {
        let request = CreateLogReferenceRequest {
            session_id: session_id.get(),
            blob_key: blob_key.to_string(),
            size_bytes,
        };
        let response = self
            .client
            .clone()
            .create_log_reference(request)
            .await?
            .into_inner();
        Ok(LogReferenceId::new(response.log_reference_id))
    }
}

// =============================================================================
// Mock
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedLogReference {
    pub session_id: SessionId,
    pub blob_key: String,
    pub size_bytes: u64,
}

#[derive(Default)]
struct MockState {
    servers: HashMap<String, ServerId>,
    capabilities: HashMap<ServerId, HostInfo>,
    log_references: Vec<RecordedLogReference>,
}

/// In-memory control plane. Registration is keyed by name like the real API.
#[derive(Default)]
pub struct MockControlPlane {
    state: Mutex<MockState>,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_references(&self) -> Vec<RecordedLogReference> {
        self.state
            .lock()
            .map(|s| s.log_references.clone())
            .unwrap_or_default()
    }

    pub fn capabilities(&self, server_id: ServerId) -> Option<HostInfo> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.capabilities.get(&server_id).cloned())
    }
}

fn poisoned() -> ControlPlaneError {
    ControlPlaneError::Rpc(tonic::Status::internal("mock poisoned"))
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn register_server(
        &self,
        name: &str,
        _environment: &str,
        info: &HostInfo,
    ) -> Result<Registration, ControlPlaneError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if let Some(id) = state.servers.get(name) {
            return Ok(Registration {
                server_id: *id,
                created: false,
            });
        }

        let server_id = ServerId::new(state.servers.len() as i64 + 1);
        state.servers.insert(name.to_string(), server_id);
        // Capabilities are stored once, on first registration.
        state.capabilities.entry(server_id).or_insert_with(|| info.clone());
        Ok(Registration {
            server_id,
            created: true,
        })
    }

    async fn create_log_reference(
        &self,
        session_id: SessionId,
        blob_key: &str,
        size_bytes: u64,
    ) -> Result<LogReferenceId, ControlPlaneError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.log_references.push(RecordedLogReference {
            session_id,
            blob_key: blob_key.to_string(),
            size_bytes,
        });
        Ok(LogReferenceId::new(state.log_references.len() as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;

    #[test]
    fn test_server_name_prefers_override() {
        assert_eq!(server_name(Some("mc-01"), "prod"), "mc-01");
        assert_eq!(server_name(Some("  "), "prod").rsplit('-').next(), Some("prod"));
        assert!(server_name(None, "dev").ends_with("-dev"));
    }

    #[tokio::test]
    async fn test_registration_is_stable_across_restarts() {
        let control_plane = MockControlPlane::new();
        let runtime = MockRuntime::new();

        let first = register(&control_plane, &runtime, "host-a-prod", "prod", 3)
            .await
            .unwrap();
        let second = register(&control_plane, &runtime, "host-a-prod", "prod", 3)
            .await
            .unwrap();
        let other = register(&control_plane, &runtime, "host-b-prod", "prod", 3)
            .await
            .unwrap();

        assert_eq!(first.server_id, second.server_id);
        assert!(first.created);
        assert!(!second.created);
        assert_ne!(first.server_id, other.server_id);
        assert_eq!(
            control_plane.capabilities(first.server_id).unwrap().docker_version,
            "mock"
        );
    }
}
