//! Games and game configs.

use manman_id::{GameConfigId, GameId};
use sqlx::{postgres::PgPool, types::Json};

use crate::{DbError, Game, GameConfig, NewGameConfig};

const GAME_COLUMNS: &str = "id, name, description, created_at";
const GAME_CONFIG_COLUMNS: &str = "id, game_id, name, image, command, args_template, \
     env_template, files, parameters, working_dir, created_at";

#[derive(Clone)]
pub struct GameRepository {
    pool: PgPool,
}

impl GameRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, name: &str, description: Option<&str>) -> Result<Game, DbError> {
        sqlx::query_as::<_, Game>(&format!(
            "INSERT INTO games (name, description) VALUES ($1, $2) RETURNING {GAME_COLUMNS}"
        ))
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from_query)
    }

    pub async fn get(&self, id: GameId) -> Result<Option<Game>, DbError> {
        sqlx::query_as::<_, Game>(&format!("SELECT {GAME_COLUMNS} FROM games WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)
    }

    pub async fn list(&self) -> Result<Vec<Game>, DbError> {
        sqlx::query_as::<_, Game>(&format!("SELECT {GAME_COLUMNS} FROM games ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)
    }

    pub async fn update(
        &self,
        id: GameId,
        name: &str,
        description: Option<&str>,
    ) -> Result<Game, DbError> {
        sqlx::query_as::<_, Game>(&format!(
            "UPDATE games SET name = $2, description = $3 WHERE id = $1 RETURNING {GAME_COLUMNS}"
        ))
        .bind(id.get())
        .bind(name)
        .bind(description)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from_query)?
        .ok_or_else(|| DbError::not_found(GameId::LABEL, id))
    }

    /// Fails with [`DbError::Conflict`] while configs of the game exist.
    pub async fn delete(&self, id: GameId) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM games WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(DbError::from_query)?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Clone)]
pub struct GameConfigRepository {
    pool: PgPool,
}

impl GameConfigRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: &NewGameConfig) -> Result<GameConfig, DbError> {
        sqlx::query_as::<_, GameConfig>(&format!(
            r#"
            INSERT INTO game_configs
                (game_id, name, image, command, args_template, env_template, files, parameters, working_dir)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {GAME_CONFIG_COLUMNS}
            "#
        ))
        .bind(new.game_id.get())
        .bind(&new.name)
        .bind(&new.image)
        .bind(&new.command)
        .bind(Json(&new.args_template))
        .bind(Json(&new.env_template))
        .bind(Json(&new.files))
        .bind(Json(&new.parameters))
        .bind(new.working_dir.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from_query)
    }

    pub async fn get(&self, id: GameConfigId) -> Result<Option<GameConfig>, DbError> {
        sqlx::query_as::<_, GameConfig>(&format!(
            "SELECT {GAME_CONFIG_COLUMNS} FROM game_configs WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn list_by_game(&self, game_id: GameId) -> Result<Vec<GameConfig>, DbError> {
        sqlx::query_as::<_, GameConfig>(&format!(
            "SELECT {GAME_CONFIG_COLUMNS} FROM game_configs WHERE game_id = $1 ORDER BY id"
        ))
        .bind(game_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    /// Replaces the launch template.
    ///
    /// A config that any session has used is immutable; create a new config
    /// instead. That case fails with [`DbError::Conflict`].
    pub async fn update(&self, id: GameConfigId, new: &NewGameConfig) -> Result<GameConfig, DbError> {
        let updated = sqlx::query_as::<_, GameConfig>(&format!(
            r#"
            UPDATE game_configs
            SET game_id = $2, name = $3, image = $4, command = $5, args_template = $6,
                env_template = $7, files = $8, parameters = $9, working_dir = $10
            WHERE id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM sessions s
                  JOIN server_game_configs sgc ON sgc.id = s.sgc_id
                  WHERE sgc.game_config_id = $1
              )
            RETURNING {GAME_CONFIG_COLUMNS}
            "#
        ))
        .bind(id.get())
        .bind(new.game_id.get())
        .bind(&new.name)
        .bind(&new.image)
        .bind(&new.command)
        .bind(Json(&new.args_template))
        .bind(Json(&new.env_template))
        .bind(Json(&new.files))
        .bind(Json(&new.parameters))
        .bind(new.working_dir.as_deref())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from_query)?;

        match updated {
            Some(config) => Ok(config),
            None if self.get(id).await?.is_some() => Err(DbError::Conflict(format!(
                "game config {id} is referenced by a session"
            ))),
            None => Err(DbError::not_found(GameConfigId::LABEL, id)),
        }
    }

    /// Fails with [`DbError::Conflict`] while a server game config uses it.
    pub async fn delete(&self, id: GameConfigId) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM game_configs WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(DbError::from_query)?;
        Ok(result.rows_affected() > 0)
    }
}
