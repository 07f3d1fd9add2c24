//! Container runtime interface and mock implementation.
//!
//! The runtime abstracts the Docker operations a session needs:
//! - an isolated network per session
//! - creating, starting, stopping and removing the session container
//! - listing containers labeled as managed by this server
//!
//! A mock implementation is provided for testing and development.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use manman_bus::BackoffPolicy;
use manman_events::PortBinding;
use manman_id::{ServerId, SessionId, SgcId};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const LABEL_MANAGED: &str = "manman.managed";
pub const LABEL_SERVER_ID: &str = "manman.server_id";
pub const LABEL_SESSION_ID: &str = "manman.session_id";
pub const LABEL_SGC_ID: &str = "manman.sgc_id";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Daemon unreachable, busy or restarting. Worth retrying.
    #[error("transient runtime error: {0}")]
    Transient(String),

    /// Rejected request, e.g. an unknown image. Retrying cannot help.
    #[error("runtime rejected request: {0}")]
    Permanent(String),

    #[error("runtime call timed out after {0:?}")]
    Timeout(Duration),
}

impl RuntimeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Runs `op` under `deadline`, retrying transient failures with backoff.
pub async fn with_retry<T, F, Fut>(
    what: &str,
    backoff: &BackoffPolicy,
    max_attempts: u32,
    deadline: Duration,
    mut op: F,
) -> Result<T, RuntimeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RuntimeError>>,
{
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(deadline, op()).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout(deadline)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let delay = backoff.delay(attempt);
                warn!(op = what, attempt, error = %e, delay_ms = delay.as_millis() as u64, "Runtime call failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Host resources reported at registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInfo {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub docker_version: String,
}

/// Everything needed to create one session container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    /// Command run as the container entrypoint (the wrapper).
    pub entrypoint: Vec<String>,
    pub env: Vec<String>,
    /// `host:container[:ro]` bind mounts.
    pub binds: Vec<String>,
    pub ports: Vec<PortBinding>,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Labels tying a container to this server and session.
    pub fn session_labels(
        server_id: ServerId,
        session_id: SessionId,
        sgc_id: SgcId,
    ) -> HashMap<String, String> {
        HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_SERVER_ID.to_string(), server_id.to_string()),
            (LABEL_SESSION_ID.to_string(), session_id.to_string()),
            (LABEL_SGC_ID.to_string(), sgc_id.to_string()),
        ])
    }
}

/// Live state of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
    pub exit_code: Option<i64>,
    /// Container IP on its session network.
    pub ip_address: Option<String>,
}

/// A container carrying this server's management labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub id: String,
    pub session_id: Option<SessionId>,
    pub sgc_id: Option<SgcId>,
    pub running: bool,
}

impl ManagedContainer {
    /// Builds a summary from container labels.
    pub fn from_labels(id: String, labels: &HashMap<String, String>, running: bool) -> Self {
        Self {
            id,
            session_id: labels
                .get(LABEL_SESSION_ID)
                .and_then(|v| SessionId::parse(v).ok()),
            sgc_id: labels.get(LABEL_SGC_ID).and_then(|v| SgcId::parse(v).ok()),
            running,
        }
    }
}

pub fn network_name(session_id: SessionId) -> String {
    format!("manman-session-{}", session_id)
}

pub fn container_name(session_id: SessionId) -> String {
    format!("manman-session-{}", session_id)
}

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn info(&self) -> Result<HostInfo, RuntimeError>;

    /// Creates a network. An existing network with the same name is reused.
    async fn create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), RuntimeError>;

    /// Removes a network. A missing network is not an error.
    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError>;

    /// Creates a container and returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Stops a container, killing it after `timeout`.
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-removes a container. A missing container is not an error.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Returns `None` if the container does not exist.
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerState>, RuntimeError>;

    /// Lists every container labeled as managed by `server_id`, running or not.
    async fn list_managed(&self, server_id: ServerId) -> Result<Vec<ManagedContainer>, RuntimeError>;
}

// =============================================================================
// Mock
// =============================================================================

#[derive(Debug, Clone)]
struct MockContainer {
    spec: ContainerSpec,
    running: bool,
    exit_code: Option<i64>,
    ip_address: String,
}

/// In-memory runtime for testing and development.
pub struct MockRuntime {
    counter: AtomicU64,
    containers: Mutex<HashMap<String, MockContainer>>,
    networks: Mutex<Vec<String>>,
    fail_creates: Mutex<Option<RuntimeError>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            containers: Mutex::new(HashMap::new()),
            networks: Mutex::new(Vec::new()),
            fail_creates: Mutex::new(None),
        }
    }

    /// Makes every following `create_container` fail with `error`.
    pub fn fail_creates_with(&self, error: Option<RuntimeError>) {
        if let Ok(mut slot) = self.fail_creates.lock() {
            *slot = error;
        }
    }

    /// Adds a container as if it had been left behind by an earlier run.
    pub fn insert_container(&self, id: &str, spec: ContainerSpec, running: bool) {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut containers) = self.containers.lock() {
            containers.insert(
                id.to_string(),
                MockContainer {
                    spec,
                    running,
                    exit_code: (!running).then_some(0),
                    ip_address: format!("10.88.{}.{}", n / 250, n % 250 + 2),
                },
            );
        }
    }

    /// Simulates the container's main process exiting.
    pub fn exit_container(&self, id: &str, exit_code: i64) {
        if let Ok(mut containers) = self.containers.lock() {
            if let Some(c) = containers.get_mut(id) {
                c.running = false;
                c.exit_code = Some(exit_code);
            }
        }
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.containers
            .lock()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.containers
            .lock()
            .map(|c| c.get(id).is_some_and(|c| c.running))
            .unwrap_or(false)
    }

    pub fn networks(&self) -> Vec<String> {
        self.networks.lock().map(|n| n.clone()).unwrap_or_default()
    }

    fn set_running(&self, id: &str, running: bool, exit_code: Option<i64>) -> Result<(), RuntimeError> {
        let mut containers = self
            .containers
            .lock()
            .map_err(|_| RuntimeError::Permanent("mock poisoned".to_string()))?;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::Permanent(format!("no such container: {id}")))?;
        container.running = running;
        container.exit_code = exit_code;
        Ok(())
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> RuntimeError {
    RuntimeError::Permanent("mock poisoned".to_string())
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn info(&self) -> Result<HostInfo, RuntimeError> {
        Ok(HostInfo {
            cpu_cores: 4,
            memory_bytes: 8 * 1024 * 1024 * 1024,
            docker_version: "mock".to_string(),
        })
    }

    async fn create_network(
        &self,
        name: &str,
        _labels: &HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let mut networks = self.networks.lock().map_err(|_| poisoned())?;
        if !networks.iter().any(|n| n == name) {
            networks.push(name.to_string());
        }
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.networks
            .lock()
            .map_err(|_| poisoned())?
            .retain(|n| n != name);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        if let Some(err) = self.fail_creates.lock().map_err(|_| poisoned())?.clone() {
            return Err(err);
        }

        let id = format!("mock-{:08x}", self.counter.fetch_add(1, Ordering::SeqCst));
        info!(container = %id, image = %spec.image, "[MOCK] Creating container");
        self.insert_container(&id, spec.clone(), false);
        self.set_running(&id, false, None)?;
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        debug!(container = %id, "[MOCK] Starting container");
        self.set_running(id, true, None)
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<(), RuntimeError> {
        debug!(container = %id, "[MOCK] Stopping container");
        self.set_running(id, false, Some(0))
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        debug!(container = %id, "[MOCK] Killing container");
        self.set_running(id, false, Some(137))
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.containers.lock().map_err(|_| poisoned())?.remove(id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerState>, RuntimeError> {
        let containers = self.containers.lock().map_err(|_| poisoned())?;
        Ok(containers.get(id).map(|c| ContainerState {
            running: c.running,
            exit_code: c.exit_code,
            ip_address: c.running.then(|| c.ip_address.clone()),
        }))
    }

    async fn list_managed(&self, server_id: ServerId) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let containers = self.containers.lock().map_err(|_| poisoned())?;
        let server = server_id.to_string();
        Ok(containers
            .iter()
            .filter(|(_, c)| c.spec.labels.get(LABEL_SERVER_ID) == Some(&server))
            .map(|(id, c)| ManagedContainer::from_labels(id.clone(), &c.spec.labels, c.running))
            .collect())
    }
}
