//! Pointers to session artifacts held in the blob store.
//!
//! Deleting a row does not delete the blob.

use manman_id::{BackupId, LogReferenceId, SessionId};
use sqlx::postgres::PgPool;

use crate::{Backup, DbError, LogReference};

const LOG_REFERENCE_COLUMNS: &str = "id, session_id, blob_key, size_bytes, created_at";
const BACKUP_COLUMNS: &str = "id, session_id, blob_key, size_bytes, description, created_at";

fn size_to_db(size_bytes: u64) -> i64 {
    i64::try_from(size_bytes).unwrap_or(i64::MAX)
}

#[derive(Clone)]
pub struct LogReferenceRepository {
    pool: PgPool,
}

impl LogReferenceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        session_id: SessionId,
        blob_key: &str,
        size_bytes: u64,
    ) -> Result<LogReference, DbError> {
        sqlx::query_as::<_, LogReference>(&format!(
            r#"
            INSERT INTO log_references (session_id, blob_key, size_bytes)
            VALUES ($1, $2, $3)
            RETURNING {LOG_REFERENCE_COLUMNS}
            "#
        ))
        .bind(session_id.get())
        .bind(blob_key)
        .bind(size_to_db(size_bytes))
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from_query)
    }

    pub async fn get(&self, id: LogReferenceId) -> Result<Option<LogReference>, DbError> {
        sqlx::query_as::<_, LogReference>(&format!(
            "SELECT {LOG_REFERENCE_COLUMNS} FROM log_references WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn list_by_session(&self, session_id: SessionId) -> Result<Vec<LogReference>, DbError> {
        sqlx::query_as::<_, LogReference>(&format!(
            "SELECT {LOG_REFERENCE_COLUMNS} FROM log_references WHERE session_id = $1 ORDER BY id"
        ))
        .bind(session_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn delete(&self, id: LogReferenceId) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM log_references WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Clone)]
pub struct BackupRepository {
    pool: PgPool,
}

impl BackupRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        session_id: SessionId,
        blob_key: &str,
        size_bytes: u64,
        description: Option<&str>,
    ) -> Result<Backup, DbError> {
        sqlx::query_as::<_, Backup>(&format!(
            r#"
            INSERT INTO backups (session_id, blob_key, size_bytes, description)
            VALUES ($1, $2, $3, $4)
            RETURNING {BACKUP_COLUMNS}
            "#
        ))
        .bind(session_id.get())
        .bind(blob_key)
        .bind(size_to_db(size_bytes))
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from_query)
    }

    pub async fn get(&self, id: BackupId) -> Result<Option<Backup>, DbError> {
        sqlx::query_as::<_, Backup>(&format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)
    }

    pub async fn list_by_session(&self, session_id: SessionId) -> Result<Vec<Backup>, DbError> {
        sqlx::query_as::<_, Backup>(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups WHERE session_id = $1 ORDER BY id"
        ))
        .bind(session_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn delete(&self, id: BackupId) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM backups WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }
}
