//! Server game config rows.

use manman_events::PortBinding;
use manman_id::{GameConfigId, ServerId, SgcId};
use manman_params::ParamValues;
use sqlx::{postgres::PgPool, types::Json};
use tracing::info;

use crate::ports::allocate_bindings;
use crate::{DbError, ServerGameConfig};

const SGC_COLUMNS: &str = "id, server_id, game_config_id, port_bindings, parameters, created_at";

#[derive(Debug, Clone)]
pub struct NewServerGameConfig {
    pub server_id: ServerId,
    pub game_config_id: GameConfigId,
    pub port_bindings: Vec<PortBinding>,
    pub parameters: ParamValues,
}

#[derive(Clone)]
pub struct SgcRepository {
    pool: PgPool,
}

impl SgcRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates an SGC and allocates the host side of its port bindings in
    /// the same transaction. A taken port rolls the whole creation back.
    ///
    /// Bindings with `host_port` 0 get a free port assigned, and the stored
    /// SGC carries the assigned values.
    pub async fn create(&self, new: &NewServerGameConfig) -> Result<ServerGameConfig, DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        let sgc = sqlx::query_as::<_, ServerGameConfig>(&format!(
            r#"
            INSERT INTO server_game_configs (server_id, game_config_id, port_bindings, parameters)
            VALUES ($1, $2, $3, $4)
            RETURNING {SGC_COLUMNS}
            "#
        ))
        .bind(new.server_id.get())
        .bind(new.game_config_id.get())
        .bind(Json(&new.port_bindings))
        .bind(Json(&new.parameters))
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::from_query)?;

        let bindings = allocate_bindings(&mut tx, sgc.server_id, sgc.id, &new.port_bindings).await?;
        let sgc = if bindings == new.port_bindings {
            sgc
        } else {
            sqlx::query_as::<_, ServerGameConfig>(&format!(
                "UPDATE server_game_configs SET port_bindings = $2 WHERE id = $1 RETURNING {SGC_COLUMNS}"
            ))
            .bind(sgc.id.get())
            .bind(Json(&bindings))
            .fetch_one(&mut *tx)
            .await
            .map_err(DbError::Query)?
        };

        tx.commit().await.map_err(DbError::Query)?;

        info!(
            sgc_id = %sgc.id,
            server_id = %sgc.server_id,
            ports = bindings.len(),
            "Server game config created"
        );
        Ok(sgc)
    }

    pub async fn get(&self, id: SgcId) -> Result<Option<ServerGameConfig>, DbError> {
        sqlx::query_as::<_, ServerGameConfig>(&format!(
            "SELECT {SGC_COLUMNS} FROM server_game_configs WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn list_by_server(&self, server_id: ServerId) -> Result<Vec<ServerGameConfig>, DbError> {
        sqlx::query_as::<_, ServerGameConfig>(&format!(
            "SELECT {SGC_COLUMNS} FROM server_game_configs WHERE server_id = $1 ORDER BY id"
        ))
        .bind(server_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn update_parameters(
        &self,
        id: SgcId,
        parameters: &ParamValues,
    ) -> Result<ServerGameConfig, DbError> {
        sqlx::query_as::<_, ServerGameConfig>(&format!(
            r#"
            UPDATE server_game_configs SET parameters = $2
            WHERE id = $1
            RETURNING {SGC_COLUMNS}
            "#
        ))
        .bind(id.get())
        .bind(Json(parameters))
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?
        .ok_or_else(|| DbError::not_found(SgcId::LABEL, id))
    }

    /// Deletes an SGC along with its port allocations and finished sessions.
    ///
    /// Rejected with [`DbError::Conflict`] while a session of the SGC is
    /// pending or active. Returns false if the SGC does not exist.
    pub async fn delete(&self, id: SgcId) -> Result<bool, DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        let locked: Option<i64> =
            sqlx::query_scalar("SELECT id FROM server_game_configs WHERE id = $1 FOR UPDATE")
                .bind(id.get())
                .fetch_optional(&mut *tx)
                .await
                .map_err(DbError::Query)?;
        if locked.is_none() {
            return Ok(false);
        }

        let active: i64 = sqlx::query_scalar(
            r#"
            SELECT count(*) FROM sessions
            WHERE sgc_id = $1 AND status IN ('pending', 'starting', 'running', 'stopping')
            "#,
        )
        .bind(id.get())
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::Query)?;
        if active > 0 {
            return Err(DbError::Conflict(format!(
                "server game config {id} has {active} active session(s)"
            )));
        }

        // server_ports and sessions cascade.
        sqlx::query("DELETE FROM server_game_configs WHERE id = $1")
            .bind(id.get())
            .execute(&mut *tx)
            .await
            .map_err(DbError::from_query)?;

        tx.commit().await.map_err(DbError::Query)?;
        info!(sgc_id = %id, "Server game config deleted");
        Ok(true)
    }
}
