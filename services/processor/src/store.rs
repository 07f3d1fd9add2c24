//! Persistence used by the processor.
//!
//! Every write is a compare-and-set: it names the status it expects to find
//! and returns `None` when the row has moved on. [`PgStore`] delegates to the
//! repositories in `manman-store`; [`MemoryStore`] keeps rows in memory for
//! tests and local development.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use manman_events::{ServerStatus, SessionStatus};
use manman_id::{ServerId, SessionId, SgcId};
use manman_store::{Database, DbError, Server, ServerStatusChange, Session};

#[async_trait]
pub trait ProcessorStore: Send + Sync {
    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, DbError>;

    async fn update_session_status(
        &self,
        id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<Option<Session>, DbError>;

    /// Moves to `running` and records `started_at`.
    async fn update_session_start(
        &self,
        id: SessionId,
        from: SessionStatus,
    ) -> Result<Option<Session>, DbError>;

    /// Moves to a terminal status and records `ended_at` and the exit code.
    async fn update_session_end(
        &self,
        id: SessionId,
        from: SessionStatus,
        status: SessionStatus,
        exit_code: Option<i32>,
    ) -> Result<Option<Session>, DbError>;

    async fn update_server_seen(
        &self,
        id: ServerId,
        status: ServerStatus,
        seen_at: DateTime<Utc>,
    ) -> Result<Option<ServerStatusChange>, DbError>;

    async fn list_stale_servers(&self, threshold: Duration) -> Result<Vec<Server>, DbError>;

    /// Marks the servers offline; returns only those that were online.
    async fn mark_servers_offline(&self, ids: &[ServerId]) -> Result<Vec<Server>, DbError>;
}

// =============================================================================
// Postgres
// =============================================================================

pub struct PgStore {
    db: Database,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ProcessorStore for PgStore {
    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, DbError> {
        self.db.sessions().get(id).await
    }

    async fn update_session_status(
        &self,
        id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<Option<Session>, DbError> {
        self.db.sessions().update_status(id, from, to).await
    }

    async fn update_session_start(
        &self,
        id: SessionId,
        from: SessionStatus,
    ) -> Result<Option<Session>, DbError> {
        self.db.sessions().update_session_start(id, from).await
    }

    async fn update_session_end(
        &self,
        id: SessionId,
        from: SessionStatus,
        status: SessionStatus,
        exit_code: Option<i32>,
    ) -> Result<Option<Session>, DbError> {
        self.db
            .sessions()
            .update_session_end(id, from, status, exit_code)
            .await
    }

    async fn update_server_seen(
        &self,
        id: ServerId,
        status: ServerStatus,
        seen_at: DateTime<Utc>,
    ) -> Result<Option<ServerStatusChange>, DbError> {
        self.db
            .servers()
            .update_status_and_last_seen(id, status, seen_at)
            .await
    }

    async fn list_stale_servers(&self, threshold: Duration) -> Result<Vec<Server>, DbError> {
        self.db.servers().list_stale_servers(threshold).await
    }

    async fn mark_servers_offline(&self, ids: &[ServerId]) -> Result<Vec<Server>, DbError> {
        self.db.servers().mark_servers_offline(ids).await
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Default)]
struct Rows {
    sessions: HashMap<SessionId, Session>,
    servers: HashMap<ServerId, Server>,
    unavailable: bool,
}

/// In-memory store with the same compare-and-set semantics as [`PgStore`].
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Rows>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_session(&self, id: SessionId, sgc_id: SgcId, status: SessionStatus) {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.sessions.insert(
            id,
            Session {
                id,
                sgc_id,
                status,
                parameters: Default::default(),
                started_at: None,
                ended_at: None,
                exit_code: None,
                created_at: now,
                updated_at: now,
            },
        );
    }

    pub fn insert_server(
        &self,
        id: ServerId,
        name: &str,
        status: ServerStatus,
        last_seen: Option<DateTime<Utc>>,
    ) {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.servers.insert(
            id,
            Server {
                id,
                name: name.to_string(),
                environment: "test".to_string(),
                status,
                last_seen,
                created_at: Utc::now(),
            },
        );
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.sessions.get(&id).cloned()
    }

    pub fn server(&self, id: ServerId) -> Option<Server> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.servers.get(&id).cloned()
    }

    /// Makes every following call fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.unavailable = unavailable;
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Rows>, DbError> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        if rows.unavailable {
            return Err(DbError::Query(sqlx::Error::PoolTimedOut));
        }
        Ok(rows)
    }

    fn swap_session(
        &self,
        id: SessionId,
        from: SessionStatus,
        apply: impl FnOnce(&mut Session),
    ) -> Result<Option<Session>, DbError> {
        let mut rows = self.lock()?;
        match rows.sessions.get_mut(&id) {
            Some(session) if session.status == from => {
                apply(session);
                session.updated_at = Utc::now();
                Ok(Some(session.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl ProcessorStore for MemoryStore {
    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, DbError> {
        Ok(self.lock()?.sessions.get(&id).cloned())
    }

    async fn update_session_status(
        &self,
        id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<Option<Session>, DbError> {
        self.swap_session(id, from, |s| s.status = to)
    }

    async fn update_session_start(
        &self,
        id: SessionId,
        from: SessionStatus,
    ) -> Result<Option<Session>, DbError> {
        self.swap_session(id, from, |s| {
            s.status = SessionStatus::Running;
            s.started_at.get_or_insert_with(Utc::now);
        })
    }

    async fn update_session_end(
        &self,
        id: SessionId,
        from: SessionStatus,
        status: SessionStatus,
        exit_code: Option<i32>,
    ) -> Result<Option<Session>, DbError> {
        if !status.is_terminal() {
            return Err(DbError::Conflict(format!(
                "session end requires a terminal status, got {status}"
            )));
        }
        self.swap_session(id, from, |s| {
            s.status = status;
            s.ended_at = Some(Utc::now());
            s.exit_code = exit_code;
        })
    }

    async fn update_server_seen(
        &self,
        id: ServerId,
        status: ServerStatus,
        seen_at: DateTime<Utc>,
    ) -> Result<Option<ServerStatusChange>, DbError> {
        let mut rows = self.lock()?;
        let Some(server) = rows.servers.get_mut(&id) else {
            return Ok(None);
        };
        let previous = server.status;
        server.status = status;
        server.last_seen = Some(server.last_seen.map_or(seen_at, |last| last.max(seen_at)));
        Ok(Some(ServerStatusChange {
            previous,
            server: server.clone(),
        }))
    }

    async fn list_stale_servers(&self, threshold: Duration) -> Result<Vec<Server>, DbError> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| DbError::Decode(e.to_string()))?;
        let cutoff = Utc::now() - threshold;
        let rows = self.lock()?;
        let mut stale: Vec<Server> = rows
            .servers
            .values()
            .filter(|s| s.status == ServerStatus::Online)
            .filter(|s| s.last_seen.map_or(true, |seen| seen < cutoff))
            .cloned()
            .collect();
        stale.sort_by_key(|s| s.id);
        Ok(stale)
    }

    async fn mark_servers_offline(&self, ids: &[ServerId]) -> Result<Vec<Server>, DbError> {
        let mut rows = self.lock()?;
        let mut changed = Vec::new();
        for id in ids {
            if let Some(server) = rows.servers.get_mut(id) {
                if server.status == ServerStatus::Online {
                    server.status = ServerStatus::Offline;
                    changed.push(server.clone());
                }
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_session_writes_are_compare_and_set() {
        let store = MemoryStore::new();
        let id = SessionId::new(1);
        store.insert_session(id, SgcId::new(1), SessionStatus::Starting);

        let moved = store
            .update_session_start(id, SessionStatus::Starting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.status, SessionStatus::Running);
        assert!(moved.started_at.is_some());

        let missed = store
            .update_session_start(id, SessionStatus::Starting)
            .await
            .unwrap();
        assert!(missed.is_none());
    }

    #[tokio::test]
    async fn test_memory_last_seen_never_moves_backwards() {
        let store = MemoryStore::new();
        let id = ServerId::new(1);
        let now = Utc::now();
        store.insert_server(id, "node-a", ServerStatus::Online, Some(now));

        let change = store
            .update_server_seen(id, ServerStatus::Online, now - chrono::Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.server.last_seen, Some(now));
    }

    #[tokio::test]
    async fn test_memory_unavailable_is_transient() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.get_session(SessionId::new(1)).await.unwrap_err();
        assert!(err.is_transient());
    }
}
