//! Local session snapshot.
//!
//! The host manager keeps one record per session it has touched. The
//! snapshot is written to disk after every change by writing a temporary
//! file in the same directory and renaming it over the old one, so a crash
//! mid-write leaves the previous snapshot intact. At startup the snapshot is
//! reconciled against live Docker state rather than trusted as-is.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use manman_events::SessionStatus;
use manman_id::{ServerId, SessionId, SgcId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("state lock poisoned")]
    Poisoned,
}

/// Session status as seen by this host.
///
/// `Lost` marks a record whose container disappeared while the host manager
/// was not watching. The control plane has no such status; it is reported
/// as `crashed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Lost,
}

impl LocalStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Status published on the bus for this local status.
    pub fn reported(&self) -> SessionStatus {
        match self {
            Self::Starting => SessionStatus::Starting,
            Self::Running => SessionStatus::Running,
            Self::Stopping => SessionStatus::Stopping,
            Self::Stopped => SessionStatus::Stopped,
            Self::Crashed | Self::Lost => SessionStatus::Crashed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub sgc_id: SgcId,
    pub status: LocalStatus,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    /// `http://ip:port` of the session's wrapper once the container runs.
    #[serde(default)]
    pub wrapper_address: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(session_id: SessionId, sgc_id: SgcId, status: LocalStatus) -> Self {
        Self {
            session_id,
            sgc_id,
            status,
            container_id: None,
            network: None,
            wrapper_address: None,
            exit_code: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub server_id: Option<ServerId>,
    #[serde(default)]
    pub sessions: Vec<SessionRecord>,
}

/// Snapshot guarded by a mutex and persisted on every change.
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<Snapshot>,
}

impl StateStore {
    /// Loads the snapshot at `path`, starting empty if it does not exist.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let snapshot = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), sessions = snapshot.sessions.len(), "Loaded session snapshot");

        Ok(Self {
            path,
            inner: Mutex::new(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with<T>(&self, f: impl FnOnce(&mut Snapshot) -> T) -> Result<T, StateError> {
        let mut snapshot = self.inner.lock().map_err(|_| StateError::Poisoned)?;
        let out = f(&mut snapshot);
        write_atomic(&self.path, &snapshot)?;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> Result<T, StateError> {
        let snapshot = self.inner.lock().map_err(|_| StateError::Poisoned)?;
        Ok(f(&snapshot))
    }

    pub fn server_id(&self) -> Result<Option<ServerId>, StateError> {
        self.read(|s| s.server_id)
    }

    /// Records the server id. A different id discards every record, since
    /// those sessions belong to another server identity.
    pub fn set_server_id(&self, server_id: ServerId) -> Result<(), StateError> {
        self.with(|s| {
            if s.server_id != Some(server_id) {
                s.sessions.clear();
                s.server_id = Some(server_id);
            }
        })
    }

    pub fn get(&self, session_id: SessionId) -> Result<Option<SessionRecord>, StateError> {
        self.read(|s| {
            s.sessions
                .iter()
                .find(|r| r.session_id == session_id)
                .cloned()
        })
    }

    pub fn list(&self) -> Result<Vec<SessionRecord>, StateError> {
        self.read(|s| s.sessions.clone())
    }

    /// Inserts or replaces the record of `record.session_id`.
    pub fn upsert(&self, mut record: SessionRecord) -> Result<(), StateError> {
        record.updated_at = Utc::now();
        self.with(|s| {
            match s
                .sessions
                .iter_mut()
                .find(|r| r.session_id == record.session_id)
            {
                Some(existing) => *existing = record,
                None => s.sessions.push(record),
            }
        })
    }

    pub fn remove(&self, session_id: SessionId) -> Result<Option<SessionRecord>, StateError> {
        self.with(|s| {
            let idx = s.sessions.iter().position(|r| r.session_id == session_id)?;
            Some(s.sessions.remove(idx))
        })
    }

    /// Drops terminal records last touched before `cutoff`.
    pub fn prune_terminal(&self, cutoff: DateTime<Utc>) -> Result<usize, StateError> {
        self.with(|s| {
            let before = s.sessions.len();
            s.sessions
                .retain(|r| r.status.is_active() || r.updated_at >= cutoff);
            before - s.sessions.len()
        })
    }
}

fn write_atomic(path: &Path, snapshot: &Snapshot) -> Result<(), StateError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, snapshot)?;
    tmp.as_file_mut().flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StateError::Io(e.error))?;
    Ok(())
}
