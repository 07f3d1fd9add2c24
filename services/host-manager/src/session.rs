//! Session control paths.
//!
//! Every session gets its own control path: its Docker operations and the
//! calls to its wrapper run under a per-session lock, so commands for one
//! session are applied one at a time while different sessions proceed in
//! parallel. Starts additionally serialize per server game config, which
//! keeps force-starts on the same SGC from racing each other.
//!
//! Every handler is idempotent keyed by `session_id`: a redelivered command
//! for a session that already has a record republishes the current status
//! instead of repeating the work. The exception is a start that never got
//! past `starting`, which is retried from scratch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use manman_bus::{publish_json, BackoffPolicy, Publisher};
use manman_events::routing;
use manman_events::{
    KillSessionCommand, SendInputCommand, SessionStats, SessionStatusUpdate, StartSessionCommand,
    StopSessionCommand,
};
use manman_id::{ServerId, SessionId, SgcId};
use manman_params::{merge_params, redact, render_template, validate_params, ParamError};
use manman_proto::wrapper::v1::{ConfigFile, ProcessState, StartRequest};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::blob::{session_output_key, BlobStore};
use crate::config::Config;
use crate::control_plane::ControlPlane;
use crate::error::SessionError;
use crate::runtime::{
    container_name, network_name, ContainerRuntime, ContainerSpec, ManagedContainer, RuntimeError,
};
use crate::state::{LocalStatus, SessionRecord, StateError, StateStore};
use crate::wrapper_client::{WrapperApi, WrapperClientError, WrapperStatus};

/// Path of the wrapper binary inside every session container.
pub const WRAPPER_MOUNT: &str = "/manman/wrapper";

/// Exit code reported for a session whose container was killed.
const KILLED_EXIT_CODE: i32 = 137;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub wrapper_binary: PathBuf,
    pub wrapper_port: u16,
    pub stop_timeout: Duration,
    pub starting_timeout: Duration,
    /// How long to keep dialing a freshly started wrapper.
    pub wrapper_ready_timeout: Duration,
    /// How long finished sessions stay in the snapshot for deduplication.
    pub terminal_retention: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            wrapper_binary: config.wrapper_binary.clone(),
            wrapper_port: config.wrapper_port,
            stop_timeout: config.stop_timeout,
            starting_timeout: config.starting_timeout,
            wrapper_ready_timeout: Duration::from_secs(30),
            terminal_retention: Duration::from_secs(3600),
        }
    }
}

/// Services a [`SessionManager`] drives.
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub wrappers: Arc<dyn WrapperApi>,
    pub publisher: Arc<dyn Publisher>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub blobs: Arc<dyn BlobStore>,
    pub state: Arc<StateStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LockKey {
    Session(SessionId),
    Sgc(SgcId),
}

/// What startup reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sessions whose game is still running and is being watched again.
    pub resumed: Vec<SessionId>,
    /// Records whose container disappeared.
    pub lost: Vec<SessionId>,
    /// Sessions whose game exited while nobody was watching.
    pub crashed: Vec<SessionId>,
    /// Containers removed because their session was already finished or unknown.
    pub removed: Vec<String>,
}

/// Renders the wrapper `Start` request of a session.
///
/// Parameters are merged as declared defaults, then SGC values, then
/// per-session values, and validated before any template is rendered.
pub fn render_start_request(cmd: &StartSessionCommand) -> Result<StartRequest, ParamError> {
    let game = &cmd.game_config;
    let values = merge_params(
        &game.parameters,
        &[&cmd.server_game_config.parameters, &cmd.parameters],
    );
    validate_params(&game.parameters, &values)?;
    debug!(
        session_id = %cmd.session_id,
        params = ?redact(&game.parameters, &values),
        "Rendering launch spec"
    );

    Ok(StartRequest {
        command: render_template(&game.command, &values),
        args: game
            .args_template
            .iter()
            .map(|arg| render_template(arg, &values))
            .collect(),
        env: game
            .env_template
            .iter()
            .map(|(k, v)| (k.clone(), render_template(v, &values)))
            .collect(),
        working_dir: game.working_dir.clone().unwrap_or_default(),
        files: game
            .files
            .iter()
            .map(|f| ConfigFile {
                path: render_template(&f.path, &values),
                content: render_template(&f.content, &values),
            })
            .collect(),
        force: false,
    })
}

pub struct SessionManager {
    server_id: ServerId,
    exchange: String,
    settings: SessionSettings,
    runtime: Arc<dyn ContainerRuntime>,
    wrappers: Arc<dyn WrapperApi>,
    publisher: Arc<dyn Publisher>,
    control_plane: Arc<dyn ControlPlane>,
    blobs: Arc<dyn BlobStore>,
    state: Arc<StateStore>,
    locks: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
    monitors: Mutex<JoinSet<()>>,
}

impl SessionManager {
    pub fn new(
        server_id: ServerId,
        exchange: impl Into<String>,
        settings: SessionSettings,
        deps: Collaborators,
    ) -> Self {
        Self {
            server_id,
            exchange: exchange.into(),
            settings,
            runtime: deps.runtime,
            wrappers: deps.wrappers,
            publisher: deps.publisher,
            control_plane: deps.control_plane,
            blobs: deps.blobs,
            state: deps.state,
            locks: Mutex::new(HashMap::new()),
            monitors: Mutex::new(JoinSet::new()),
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    async fn lock(&self, key: LockKey) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(key).or_default())
        };
        mutex.lock_owned().await
    }

    // =========================================================================
    // Status publishing
    // =========================================================================

    async fn publish_status(&self, record: &SessionRecord) -> Result<(), SessionError> {
        let update = SessionStatusUpdate {
            session_id: record.session_id,
            sgc_id: record.sgc_id,
            status: record.status.reported(),
            exit_code: record.exit_code,
        };
        publish_json(
            self.publisher.as_ref(),
            &self.exchange,
            &routing::session_status(record.session_id),
            &update,
        )
        .await?;
        debug!(session_id = %record.session_id, status = %update.status, "Published session status");
        Ok(())
    }

    fn persist(&self, record: &mut SessionRecord, status: LocalStatus) -> Result<(), SessionError> {
        record.status = status;
        self.state.upsert(record.clone())?;
        info!(session_id = %record.session_id, status = ?status, exit_code = ?record.exit_code, "Session transition");
        Ok(())
    }

    /// Persists `record` with `status` and publishes the change.
    async fn transition(
        &self,
        record: &mut SessionRecord,
        status: LocalStatus,
    ) -> Result<(), SessionError> {
        self.persist(record, status)?;
        self.publish_status(record).await
    }

    // =========================================================================
    // Start
    // =========================================================================

    #[instrument(skip(self, cmd), fields(session_id = %cmd.session_id, sgc_id = %cmd.sgc_id))]
    pub async fn start(self: &Arc<Self>, cmd: StartSessionCommand) -> Result<(), SessionError> {
        let _sgc_guard = self.lock(LockKey::Sgc(cmd.sgc_id)).await;
        let _guard = self.lock(LockKey::Session(cmd.session_id)).await;

        if let Some(existing) = self.state.get(cmd.session_id)? {
            if existing.status != LocalStatus::Starting {
                info!(status = ?existing.status, "Start already handled, republishing status");
                return self.publish_status(&existing).await;
            }
            // No launch is in flight while the session lock is held, so a
            // starting record is an attempt that returned early.
            warn!("Previous start attempt did not finish, starting over");
            self.teardown(&existing).await?;
            self.state.remove(cmd.session_id)?;
        }

        let others: Vec<SessionRecord> = self
            .state
            .list()?
            .into_iter()
            .filter(|r| r.sgc_id == cmd.sgc_id && r.status.is_active())
            .collect();

        let mut record = SessionRecord::new(cmd.session_id, cmd.sgc_id, LocalStatus::Starting);
        self.transition(&mut record, LocalStatus::Starting).await?;

        if let Some(other) = others.first() {
            if !cmd.force {
                return self
                    .fail_start(record, SessionError::SgcBusy(other.session_id))
                    .await;
            }
            for other in others {
                info!(other_session = %other.session_id, "Force start, killing existing session");
                let _other_guard = self.lock(LockKey::Session(other.session_id)).await;
                // Re-read under its lock; a concurrent stop may have finished it.
                if let Some(current) = self.state.get(other.session_id)? {
                    if current.status.is_active() {
                        if let Err(e) = self.kill_locked(current).await {
                            return self.fail_start(record, e).await;
                        }
                    }
                }
            }
        }

        match self.launch(&cmd, &mut record).await {
            Ok(address) => {
                // The monitor must be attached even if the publish fails and
                // the redelivery only republishes `running`.
                self.persist(&mut record, LocalStatus::Running)?;
                self.spawn_monitor(cmd.session_id, address);
                self.publish_status(&record).await
            }
            Err(e) => self.fail_start(record, e).await,
        }
    }

    /// Creates the network and container and starts the game in its wrapper.
    /// Returns the wrapper address.
    async fn launch(
        &self,
        cmd: &StartSessionCommand,
        record: &mut SessionRecord,
    ) -> Result<String, SessionError> {
        let request = render_start_request(cmd)?;
        let session_id = cmd.session_id;

        let network = network_name(session_id);
        let labels = ContainerSpec::session_labels(self.server_id, session_id, cmd.sgc_id);
        self.runtime.create_network(&network, &labels).await?;
        record.network = Some(network.clone());
        self.state.upsert(record.clone())?;

        let spec = ContainerSpec {
            name: container_name(session_id),
            image: cmd.game_config.image.clone(),
            network,
            entrypoint: vec![WRAPPER_MOUNT.to_string()],
            env: vec![format!(
                "WRAPPER_LISTEN_ADDR=0.0.0.0:{}",
                self.settings.wrapper_port
            )],
            binds: vec![format!(
                "{}:{}:ro",
                self.settings.wrapper_binary.display(),
                WRAPPER_MOUNT
            )],
            ports: cmd.server_game_config.port_bindings.clone(),
            labels,
        };

        // A container left behind by an earlier failed attempt holds the name.
        self.runtime.remove_container(&spec.name).await?;
        let container_id = self.runtime.create_container(&spec).await?;
        record.container_id = Some(container_id.clone());
        self.state.upsert(record.clone())?;

        self.runtime.start_container(&container_id).await?;
        let state = self
            .runtime
            .inspect_container(&container_id)
            .await?
            .filter(|s| s.running)
            .ok_or_else(|| RuntimeError::Permanent("container exited during start".to_string()))?;
        let ip = state
            .ip_address
            .ok_or_else(|| RuntimeError::Transient("container has no address yet".to_string()))?;

        let address = format!("http://{}:{}", ip, self.settings.wrapper_port);
        record.wrapper_address = Some(address.clone());
        self.state.upsert(record.clone())?;

        let pid = self.start_wrapper(&address, request).await?;
        info!(container = %container_id, %address, pid, "Game process started");
        Ok(address)
    }

    /// Dials a fresh wrapper until it accepts `Start` or the ready timeout passes.
    async fn start_wrapper(
        &self,
        address: &str,
        request: StartRequest,
    ) -> Result<u32, WrapperClientError> {
        let backoff = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(2));
        let deadline = tokio::time::Instant::now() + self.settings.wrapper_ready_timeout;
        let mut attempt = 0;

        loop {
            match self.wrappers.start(address, request.clone()).await {
                Ok(pid) => return Ok(pid),
                Err(WrapperClientError::Unavailable(msg))
                    if tokio::time::Instant::now() < deadline =>
                {
                    debug!(attempt, error = %msg, "Wrapper not ready yet");
                    tokio::time::sleep(backoff.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Cleans up after a failed start.
    ///
    /// Transient failures drop the record so the redelivered command starts
    /// over. Permanent failures report the session as crashed.
    async fn fail_start(
        &self,
        mut record: SessionRecord,
        err: SessionError,
    ) -> Result<(), SessionError> {
        if let Err(cleanup) = self.teardown(&record).await {
            warn!(session_id = %record.session_id, error = %cleanup, "Cleanup after failed start failed");
        }

        if err.is_transient() {
            warn!(session_id = %record.session_id, error = %err, "Start failed, will retry");
            self.state.remove(record.session_id)?;
        } else {
            error!(session_id = %record.session_id, error = %err, "Start failed");
            record.container_id = None;
            record.wrapper_address = None;
            self.transition(&mut record, LocalStatus::Crashed).await?;
        }
        Err(err)
    }

    // =========================================================================
    // Stop / Kill
    // =========================================================================

    #[instrument(skip(self, cmd), fields(session_id = %cmd.session_id, force = cmd.force))]
    pub async fn stop(&self, cmd: StopSessionCommand) -> Result<(), SessionError> {
        let _guard = self.lock(LockKey::Session(cmd.session_id)).await;
        let record = self
            .state
            .get(cmd.session_id)?
            .ok_or(SessionError::UnknownSession(cmd.session_id))?;

        if !record.status.is_active() {
            info!(status = ?record.status, "Session already finished, republishing status");
            return self.publish_status(&record).await;
        }
        self.stop_locked(record, !cmd.force).await
    }

    async fn stop_locked(
        &self,
        mut record: SessionRecord,
        graceful: bool,
    ) -> Result<(), SessionError> {
        if record.status == LocalStatus::Starting || record.wrapper_address.is_none() {
            return self.kill_locked(record).await;
        }
        if record.status != LocalStatus::Stopping {
            self.transition(&mut record, LocalStatus::Stopping).await?;
        }

        let mut exit_code = None;
        if let Some(address) = &record.wrapper_address {
            match self
                .wrappers
                .stop(address, graceful, self.settings.stop_timeout)
                .await
            {
                Ok(status) => exit_code = status.exit_code,
                Err(e) => warn!(session_id = %record.session_id, error = %e, "Wrapper stop failed, stopping container"),
            }
        }

        self.teardown(&record).await?;
        record.exit_code = exit_code;
        record.wrapper_address = None;
        self.transition(&mut record, LocalStatus::Stopped).await
    }

    #[instrument(skip(self, cmd), fields(session_id = %cmd.session_id))]
    pub async fn kill(&self, cmd: KillSessionCommand) -> Result<(), SessionError> {
        let _guard = self.lock(LockKey::Session(cmd.session_id)).await;
        let record = self
            .state
            .get(cmd.session_id)?
            .ok_or(SessionError::UnknownSession(cmd.session_id))?;

        if !record.status.is_active() {
            return self.publish_status(&record).await;
        }
        self.kill_locked(record).await
    }

    /// Kills the container and reports the session along a valid edge:
    /// a starting session crashed, a running one was stopped.
    async fn kill_locked(&self, mut record: SessionRecord) -> Result<(), SessionError> {
        if let Some(id) = &record.container_id {
            self.runtime.kill_container(id).await?;
        }
        self.teardown(&record).await?;
        record.wrapper_address = None;

        match record.status {
            LocalStatus::Starting => self.transition(&mut record, LocalStatus::Crashed).await,
            LocalStatus::Running => {
                self.transition(&mut record, LocalStatus::Stopping).await?;
                record.exit_code = Some(KILLED_EXIT_CODE);
                self.transition(&mut record, LocalStatus::Stopped).await
            }
            _ => {
                record.exit_code = Some(KILLED_EXIT_CODE);
                self.transition(&mut record, LocalStatus::Stopped).await
            }
        }
    }

    /// Stops and removes the container and network of `record`.
    async fn teardown(&self, record: &SessionRecord) -> Result<(), SessionError> {
        if let Some(id) = &record.container_id {
            self.runtime
                .stop_container(id, self.settings.stop_timeout)
                .await?;
            self.runtime.remove_container(id).await?;
        }
        if let Some(network) = &record.network {
            self.runtime.remove_network(network).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Input
    // =========================================================================

    pub async fn send_input(&self, cmd: SendInputCommand) -> Result<(), SessionError> {
        let record = self
            .state
            .get(cmd.session_id)?
            .ok_or(SessionError::UnknownSession(cmd.session_id))?;

        let address = match (&record.status, &record.wrapper_address) {
            (LocalStatus::Running, Some(address)) => address.clone(),
            (status, _) => {
                return Err(SessionError::NotRunning {
                    session_id: cmd.session_id,
                    status: status.reported().as_str(),
                })
            }
        };

        self.wrappers
            .send_input(&address, cmd.input.into_bytes())
            .await?;
        Ok(())
    }

    // =========================================================================
    // Output monitoring
    // =========================================================================

    fn spawn_monitor(self: &Arc<Self>, session_id: SessionId, address: String) {
        let manager = Arc::clone(self);
        let mut monitors = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
        while monitors.try_join_next().is_some() {}
        monitors.spawn(async move { manager.monitor(session_id, address).await });
    }

    /// Archives a session's output until it ends, then records the log
    /// reference and checks whether the game exited on its own.
    #[instrument(skip(self))]
    async fn monitor(&self, session_id: SessionId, address: String) {
        let key = session_output_key(session_id);
        let mut archived = 0u64;
        let backoff = BackoffPolicy::default();
        let mut attempt = 0;

        loop {
            if self.pump_output(&address, &key, &mut archived).await {
                break;
            }
            // The stream broke without an end marker.
            match self.wrappers.status(&address).await {
                Ok(status) if status.state == ProcessState::Running => {
                    tokio::time::sleep(backoff.delay(attempt)).await;
                    attempt += 1;
                }
                _ => break,
            }
        }

        if archived > 0 {
            match self
                .control_plane
                .create_log_reference(session_id, &key, archived)
                .await
            {
                Ok(id) => info!(log_reference_id = %id, size_bytes = archived, "Session output archived"),
                Err(e) => warn!(error = %e, "Failed to record log reference"),
            }
        }

        if let Err(e) = self.on_output_closed(session_id, &address).await {
            error!(error = %e, "Failed to handle session exit");
        }
    }

    /// Copies one output subscription into the blob store. Returns true if
    /// the wrapper signalled the end of the stream.
    async fn pump_output(&self, address: &str, key: &str, archived: &mut u64) -> bool {
        let mut stream = match self.wrappers.stream_output(address).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Could not subscribe to session output");
                return false;
            }
        };

        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) if chunk.end_of_stream => return true,
                Ok(chunk) if chunk.data.is_empty() => {}
                Ok(chunk) => match self.blobs.append(key, &chunk.data).await {
                    Ok(size) => *archived = size,
                    Err(e) => warn!(error = %e, "Failed to archive output"),
                },
                Err(e) => {
                    warn!(error = %e, "Session output stream failed");
                    return false;
                }
            }
        }
        false
    }

    async fn on_output_closed(&self, session_id: SessionId, address: &str) -> Result<(), SessionError> {
        let _guard = self.lock(LockKey::Session(session_id)).await;
        let Some(mut record) = self.state.get(session_id)? else {
            return Ok(());
        };
        // Stops and kills report their own outcome.
        if record.status != LocalStatus::Running {
            return Ok(());
        }

        let exit_code = self
            .wrappers
            .status(address)
            .await
            .ok()
            .and_then(|s| s.exit_code);
        warn!(%session_id, ?exit_code, "Game process exited unexpectedly");

        self.teardown(&record).await?;
        record.exit_code = exit_code;
        record.wrapper_address = None;
        self.transition(&mut record, LocalStatus::Crashed).await
    }

    /// Aborts output monitors. Containers keep running and are adopted by
    /// the next start's recovery.
    pub fn shutdown(&self) {
        let mut monitors = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
        monitors.abort_all();
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Reconciles the snapshot with the containers Docker actually has.
    ///
    /// Records whose container is gone become `lost`. Containers with a live
    /// wrapper are adopted and watched again; anything else is removed.
    #[instrument(skip(self), fields(server_id = %self.server_id))]
    pub async fn recover(self: &Arc<Self>) -> Result<RecoveryReport, SessionError> {
        let containers = self.runtime.list_managed(self.server_id).await?;
        let mut report = RecoveryReport::default();

        for record in self.state.list()? {
            if !record.status.is_active() {
                continue;
            }
            let has_container = containers.iter().any(|c| {
                c.session_id == Some(record.session_id)
                    || record.container_id.as_deref() == Some(c.id.as_str())
            });
            if has_container {
                continue;
            }

            let _guard = self.lock(LockKey::Session(record.session_id)).await;
            let mut lost = record;
            if let Some(network) = &lost.network {
                if let Err(e) = self.runtime.remove_network(network).await {
                    warn!(network, error = %e, "Failed to remove network of lost session");
                }
            }
            lost.container_id = None;
            lost.wrapper_address = None;
            warn!(session_id = %lost.session_id, "Container missing, marking session lost");
            report.lost.push(lost.session_id);
            self.transition(&mut lost, LocalStatus::Lost).await?;
        }

        for container in containers {
            let (Some(session_id), Some(sgc_id)) = (container.session_id, container.sgc_id) else {
                warn!(container = %container.id, "Managed container without session labels, removing");
                self.runtime.remove_container(&container.id).await?;
                report.removed.push(container.id);
                continue;
            };

            let _guard = self.lock(LockKey::Session(session_id)).await;
            let record = match self.state.get(session_id)? {
                Some(r) if r.status.is_active() => r,
                Some(_) => {
                    info!(%session_id, container = %container.id, "Removing container of finished session");
                    self.runtime.remove_container(&container.id).await?;
                    report.removed.push(container.id);
                    continue;
                }
                None => {
                    info!(%session_id, container = %container.id, "Adopting orphaned container");
                    let mut r = SessionRecord::new(session_id, sgc_id, LocalStatus::Running);
                    r.network = Some(network_name(session_id));
                    r
                }
            };

            if self.resume(record, &container).await? {
                report.resumed.push(session_id);
            } else {
                report.crashed.push(session_id);
            }
        }

        info!(
            resumed = report.resumed.len(),
            lost = report.lost.len(),
            crashed = report.crashed.len(),
            removed = report.removed.len(),
            "Recovery complete"
        );
        Ok(report)
    }

    /// Re-attaches to a session whose container exists. Returns true if the
    /// game is still running.
    async fn resume(
        self: &Arc<Self>,
        mut record: SessionRecord,
        container: &ManagedContainer,
    ) -> Result<bool, SessionError> {
        record.container_id = Some(container.id.clone());

        let address = if container.running {
            self.runtime
                .inspect_container(&container.id)
                .await?
                .and_then(|s| s.ip_address)
                .map(|ip| format!("http://{}:{}", ip, self.settings.wrapper_port))
        } else {
            None
        };

        let wrapper: Option<WrapperStatus> = match &address {
            Some(address) => self.wrappers.status(address).await.ok(),
            None => None,
        };

        match (address, wrapper) {
            (Some(address), Some(status)) if status.state == ProcessState::Running => {
                record.wrapper_address = Some(address.clone());
                if record.status == LocalStatus::Stopping {
                    self.stop_locked(record, true).await?;
                    return Ok(false);
                }
                self.transition(&mut record, LocalStatus::Running).await?;
                self.spawn_monitor(record.session_id, address);
                Ok(true)
            }
            (_, status) => {
                let exit_code = status.and_then(|s| s.exit_code);
                self.teardown(&record).await?;
                record.exit_code = exit_code;
                record.wrapper_address = None;
                let outcome = match (record.status, status.map(|s| s.state)) {
                    (LocalStatus::Stopping, Some(ProcessState::Stopped)) => LocalStatus::Stopped,
                    _ => LocalStatus::Crashed,
                };
                self.transition(&mut record, outcome).await?;
                Ok(false)
            }
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Per-status counts of the sessions this host knows about.
    pub fn stats(&self) -> Result<SessionStats, StateError> {
        let stuck_after = chrono::Duration::from_std(self.settings.starting_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let stuck_cutoff = Utc::now() - stuck_after;

        let mut stats = SessionStats::default();
        for record in self.state.list()? {
            stats.total += 1;
            match record.status {
                LocalStatus::Starting => {
                    stats.starting += 1;
                    if record.updated_at < stuck_cutoff {
                        stats.stuck_starting += 1;
                    }
                }
                LocalStatus::Running => stats.running += 1,
                LocalStatus::Stopping => stats.stopping += 1,
                LocalStatus::Stopped => stats.stopped += 1,
                LocalStatus::Crashed => stats.crashed += 1,
                LocalStatus::Lost => stats.lost += 1,
            }
        }
        Ok(stats)
    }

    /// Forgets finished sessions past the retention window and idle locks.
    pub fn prune(&self) -> Result<usize, StateError> {
        let retention = chrono::Duration::from_std(self.settings.terminal_retention)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let pruned = self.state.prune_terminal(Utc::now() - retention)?;

        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(pruned)
    }
}
