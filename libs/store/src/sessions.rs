//! Session rows.
//!
//! Status updates are compare-and-set on the current status: the caller
//! passes the status it validated the transition from, and the update only
//! applies if the row still has it. A lost race shows up as `Ok(None)`.

use manman_events::SessionStatus;
use manman_id::{SessionId, SgcId};
use manman_params::ParamValues;
use sqlx::{postgres::PgPool, types::Json};

use crate::{DbError, Session};

const SESSION_COLUMNS: &str =
    "id, sgc_id, status, parameters, started_at, ended_at, exit_code, created_at, updated_at";

#[derive(Clone)]
pub struct SessionRepository {
    pool: PgPool,
}

impl SessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates a `pending` session.
    pub async fn create(&self, sgc_id: SgcId, parameters: &ParamValues) -> Result<Session, DbError> {
        sqlx::query_as::<_, Session>(&format!(
            r#"
            INSERT INTO sessions (sgc_id, status, parameters)
            VALUES ($1, 'pending', $2)
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(sgc_id.get())
        .bind(Json(parameters))
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from_query)
    }

    pub async fn get(&self, id: SessionId) -> Result<Option<Session>, DbError> {
        sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn list_by_sgc(&self, sgc_id: SgcId) -> Result<Vec<Session>, DbError> {
        sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE sgc_id = $1 ORDER BY id"
        ))
        .bind(sgc_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    /// Sessions of an SGC that still hold host resources.
    pub async fn list_active_by_sgc(&self, sgc_id: SgcId) -> Result<Vec<Session>, DbError> {
        sqlx::query_as::<_, Session>(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM sessions
            WHERE sgc_id = $1 AND status IN ('starting', 'running', 'stopping')
            ORDER BY id
            "#
        ))
        .bind(sgc_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn delete(&self, id: SessionId) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(DbError::from_query)?;
        Ok(result.rows_affected() > 0)
    }

    /// Moves a session from `from` to `to` without touching timestamps.
    pub async fn update_status(
        &self,
        id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<Option<Session>, DbError> {
        sqlx::query_as::<_, Session>(&format!(
            r#"
            UPDATE sessions
            SET status = $3, updated_at = now()
            WHERE id = $1 AND status = $2
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(id.get())
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    /// Moves a session from `from` to `running` and records `started_at`.
    ///
    /// An existing `started_at` is kept.
    pub async fn update_session_start(
        &self,
        id: SessionId,
        from: SessionStatus,
    ) -> Result<Option<Session>, DbError> {
        sqlx::query_as::<_, Session>(&format!(
            r#"
            UPDATE sessions
            SET status = 'running',
                started_at = COALESCE(started_at, now()),
                updated_at = now()
            WHERE id = $1 AND status = $2
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(id.get())
        .bind(from.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    /// Moves a session from `from` to a terminal `status`, recording
    /// `ended_at` and the exit code.
    pub async fn update_session_end(
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

        sqlx::query_as::<_, Session>(&format!(
            r#"
            UPDATE sessions
            SET status = $3,
                ended_at = now(),
                exit_code = $4,
                updated_at = now()
            WHERE id = $1 AND status = $2
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(id.get())
        .bind(from.as_str())
        .bind(status.as_str())
        .bind(exit_code)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }
}
