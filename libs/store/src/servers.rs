//! Server (host) rows: self-registration, liveness and the stale sweep.

use std::time::Duration;

use chrono::{DateTime, Utc};
use manman_events::ServerStatus;
use manman_id::ServerId;
use sqlx::{postgres::PgPool, Row};

use crate::{DbError, Registration, Server, ServerStatusChange};

const SERVER_COLUMNS: &str = "id, name, environment, status, last_seen, created_at";

#[derive(Clone)]
pub struct ServerRepository {
    pool: PgPool,
}

impl ServerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Registers a server by name, or returns the existing row for that name.
    ///
    /// The server is marked online either way. Everything attached to an
    /// existing server (game configs, ports) is untouched, so a host that
    /// restarts under the same name keeps its id and its bindings.
    pub async fn register(&self, name: &str, environment: &str) -> Result<Registration, DbError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO servers (name, environment, status, last_seen)
            VALUES ($1, $2, 'online', now())
            ON CONFLICT (name) DO UPDATE
                SET environment = EXCLUDED.environment,
                    status = 'online',
                    last_seen = now()
            RETURNING {SERVER_COLUMNS}, (xmax = 0) AS inserted
            "#
        ))
        .bind(name)
        .bind(environment)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from_query)?;

        let created: bool = row.try_get("inserted").map_err(DbError::Query)?;
        let server: Server = sqlx::FromRow::from_row(&row).map_err(DbError::Query)?;
        Ok(Registration { server, created })
    }

    pub async fn get(&self, id: ServerId) -> Result<Option<Server>, DbError> {
        sqlx::query_as::<_, Server>(&format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Server>, DbError> {
        sqlx::query_as::<_, Server>(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn list(&self) -> Result<Vec<Server>, DbError> {
        sqlx::query_as::<_, Server>(&format!("SELECT {SERVER_COLUMNS} FROM servers ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)
    }

    /// Deletes a server. Fails with [`DbError::Conflict`] while game configs
    /// are still bound to it.
    pub async fn delete(&self, id: ServerId) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM servers WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(DbError::from_query)?;
        Ok(result.rows_affected() > 0)
    }

    /// Sets the status and advances `last_seen` to `seen_at`.
    ///
    /// `last_seen` never moves backwards, so a delayed message cannot undo a
    /// newer heartbeat. Returns `None` if the server does not exist.
    pub async fn update_status_and_last_seen(
        &self,
        id: ServerId,
        status: ServerStatus,
        seen_at: DateTime<Utc>,
    ) -> Result<Option<ServerStatusChange>, DbError> {
        let row = sqlx::query(
            r#"
            WITH prev AS (
                SELECT id, status FROM servers WHERE id = $1 FOR UPDATE
            )
            UPDATE servers s
            SET status = $2,
                last_seen = GREATEST(COALESCE(s.last_seen, $3), $3)
            FROM prev
            WHERE s.id = prev.id
            RETURNING s.id, s.name, s.environment, s.status, s.last_seen, s.created_at,
                      prev.status AS previous_status
            "#,
        )
        .bind(id.get())
        .bind(status.as_str())
        .bind(seen_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let previous: String = row.try_get("previous_status").map_err(DbError::Query)?;
        let previous = ServerStatus::parse(&previous)
            .ok_or_else(|| DbError::Decode(format!("unknown server status: {previous}")))?;
        let server: Server = sqlx::FromRow::from_row(&row).map_err(DbError::Query)?;
        Ok(Some(ServerStatusChange { previous, server }))
    }

    /// Online servers not seen for longer than `threshold`.
    pub async fn list_stale_servers(&self, threshold: Duration) -> Result<Vec<Server>, DbError> {
        sqlx::query_as::<_, Server>(&format!(
            r#"
            SELECT {SERVER_COLUMNS}
            FROM servers
            WHERE status = 'online'
              AND (last_seen IS NULL OR last_seen < now() - make_interval(secs => $1))
            ORDER BY id
            "#
        ))
        .bind(threshold.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    /// Marks the given servers offline in one statement.
    ///
    /// Only rows that were still online are changed and returned, so running
    /// the same batch twice reports each server once.
    pub async fn mark_servers_offline(&self, ids: &[ServerId]) -> Result<Vec<Server>, DbError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<i64> = ids.iter().map(|id| id.get()).collect();
        sqlx::query_as::<_, Server>(&format!(
            r#"
            UPDATE servers
            SET status = 'offline'
            WHERE id = ANY($1) AND status = 'online'
            RETURNING {SERVER_COLUMNS}
            "#
        ))
        .bind(raw)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }
}
