use manman_id::ServerId;
use sqlx::{postgres::PgPool, types::Json};

use crate::{DbError, ServerCapability};

#[derive(Clone)]
pub struct ServerCapabilityRepository {
    pool: PgPool,
}

impl ServerCapabilityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Records the capabilities of a server unless some are already stored.
    /// Returns true if this call inserted them.
    pub async fn insert_once(
        &self,
        server_id: ServerId,
        capability: &ServerCapability,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO server_capabilities (server_id, cpu_cores, memory_bytes, docker_version, extra)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (server_id) DO NOTHING
            "#,
        )
        .bind(server_id.get())
        .bind(i32::try_from(capability.cpu_cores).unwrap_or(i32::MAX))
        .bind(i64::try_from(capability.memory_bytes).unwrap_or(i64::MAX))
        .bind(&capability.docker_version)
        .bind(Json(&capability.extra))
        .execute(&self.pool)
        .await
        .map_err(DbError::from_query)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, server_id: ServerId) -> Result<Option<ServerCapability>, DbError> {
        sqlx::query_as::<_, ServerCapability>(
            r#"
            SELECT cpu_cores, memory_bytes, docker_version, extra
            FROM server_capabilities
            WHERE server_id = $1
            "#,
        )
        .bind(server_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn delete(&self, server_id: ServerId) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM server_capabilities WHERE server_id = $1")
            .bind(server_id.get())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }
}
