//! Row types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use manman_events::{
    FileTemplate, GameConfigSpec, PortBinding, Protocol, ServerGameConfigSpec, ServerStatus,
    SessionStatus,
};
use manman_id::{
    BackupId, GameConfigId, GameId, LogReferenceId, ServerId, ServerPortId, SessionId, SgcId,
};
use manman_params::{ParamDefinition, ParamValues};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, types::Json, Row};

fn decode_error(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

fn port_from_row(row: &PgRow, column: &str) -> Result<u16, sqlx::Error> {
    let port: i32 = row.try_get(column)?;
    u16::try_from(port).map_err(|_| decode_error(format!("port out of range: {port}")))
}

fn protocol_from_row(row: &PgRow) -> Result<Protocol, sqlx::Error> {
    let protocol: String = row.try_get("protocol")?;
    Protocol::parse(&protocol).ok_or_else(|| decode_error(format!("unknown protocol: {protocol}")))
}

// =============================================================================
// Fleet
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    pub environment: String,
    pub status: ServerStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for Server {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: ServerId::new(row.try_get("id")?),
            name: row.try_get("name")?,
            environment: row.try_get("environment")?,
            status: ServerStatus::parse(&status)
                .ok_or_else(|| decode_error(format!("unknown server status: {status}")))?,
            last_seen: row.try_get("last_seen")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Result of a self-registration.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub server: Server,
    /// False when an existing server was matched by name.
    pub created: bool,
}

/// A server status change, with the status it replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatusChange {
    pub previous: ServerStatus,
    pub server: Server,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapability {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub docker_version: String,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ServerCapability {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let cpu_cores: i32 = row.try_get("cpu_cores")?;
        let memory_bytes: i64 = row.try_get("memory_bytes")?;
        let extra: Json<BTreeMap<String, serde_json::Value>> = row.try_get("extra")?;
        Ok(Self {
            cpu_cores: cpu_cores.max(0) as u32,
            memory_bytes: memory_bytes.max(0) as u64,
            docker_version: row.try_get("docker_version")?,
            extra: extra.0,
        })
    }
}

// =============================================================================
// Game definitions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Game {
    pub id: GameId,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for Game {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: GameId::new(row.try_get("id")?),
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Launch template fields shared by [`GameConfig`] and its create input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGameConfig {
    pub game_id: GameId,
    pub name: String,
    pub image: String,
    pub command: String,
    #[serde(default)]
    pub args_template: Vec<String>,
    #[serde(default)]
    pub env_template: BTreeMap<String, String>,
    #[serde(default)]
    pub files: Vec<FileTemplate>,
    #[serde(default)]
    pub parameters: Vec<ParamDefinition>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameConfig {
    pub id: GameConfigId,
    #[serde(flatten)]
    pub template: NewGameConfig,
    pub created_at: DateTime<Utc>,
}

impl GameConfig {
    /// The launch template as carried by a start command.
    pub fn to_spec(&self) -> GameConfigSpec {
        let t = &self.template;
        GameConfigSpec {
            game_config_id: self.id,
            game_id: Some(t.game_id),
            name: t.name.clone(),
            image: t.image.clone(),
            command: t.command.clone(),
            args_template: t.args_template.clone(),
            env_template: t.env_template.clone(),
            files: t.files.clone(),
            parameters: t.parameters.clone(),
            working_dir: t.working_dir.clone(),
        }
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for GameConfig {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let args: Json<Vec<String>> = row.try_get("args_template")?;
        let env: Json<BTreeMap<String, String>> = row.try_get("env_template")?;
        let files: Json<Vec<FileTemplate>> = row.try_get("files")?;
        let parameters: Json<Vec<ParamDefinition>> = row.try_get("parameters")?;
        Ok(Self {
            id: GameConfigId::new(row.try_get("id")?),
            template: NewGameConfig {
                game_id: GameId::new(row.try_get("game_id")?),
                name: row.try_get("name")?,
                image: row.try_get("image")?,
                command: row.try_get("command")?,
                args_template: args.0,
                env_template: env.0,
                files: files.0,
                parameters: parameters.0,
                working_dir: row.try_get("working_dir")?,
            },
            created_at: row.try_get("created_at")?,
        })
    }
}

/// A binding of a game config to a server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerGameConfig {
    pub id: SgcId,
    pub server_id: ServerId,
    pub game_config_id: GameConfigId,
    pub port_bindings: Vec<PortBinding>,
    pub parameters: ParamValues,
    pub created_at: DateTime<Utc>,
}

impl ServerGameConfig {
    pub fn to_spec(&self) -> ServerGameConfigSpec {
        ServerGameConfigSpec {
            sgc_id: self.id,
            server_id: self.server_id,
            port_bindings: self.port_bindings.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for ServerGameConfig {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let bindings: Json<Vec<PortBinding>> = row.try_get("port_bindings")?;
        let parameters: Json<ParamValues> = row.try_get("parameters")?;
        Ok(Self {
            id: SgcId::new(row.try_get("id")?),
            server_id: ServerId::new(row.try_get("server_id")?),
            game_config_id: GameConfigId::new(row.try_get("game_config_id")?),
            port_bindings: bindings.0,
            parameters: parameters.0,
            created_at: row.try_get("created_at")?,
        })
    }
}

// =============================================================================
// Runtime
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub sgc_id: SgcId,
    pub status: SessionStatus,
    pub parameters: ParamValues,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for Session {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let parameters: Json<ParamValues> = row.try_get("parameters")?;
        Ok(Self {
            id: SessionId::new(row.try_get("id")?),
            sgc_id: SgcId::new(row.try_get("sgc_id")?),
            status: SessionStatus::parse(&status)
                .ok_or_else(|| decode_error(format!("unknown session status: {status}")))?,
            parameters: parameters.0,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            exit_code: row.try_get("exit_code")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerPort {
    pub id: ServerPortId,
    pub server_id: ServerId,
    pub port: u16,
    pub protocol: Protocol,
    pub sgc_id: SgcId,
    pub allocated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ServerPort {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: ServerPortId::new(row.try_get("id")?),
            server_id: ServerId::new(row.try_get("server_id")?),
            port: port_from_row(row, "port")?,
            protocol: protocol_from_row(row)?,
            sgc_id: SgcId::new(row.try_get("sgc_id")?),
            allocated_at: row.try_get("allocated_at")?,
        })
    }
}

// =============================================================================
// Artifacts
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogReference {
    pub id: LogReferenceId,
    pub session_id: SessionId,
    pub blob_key: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for LogReference {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let size: i64 = row.try_get("size_bytes")?;
        Ok(Self {
            id: LogReferenceId::new(row.try_get("id")?),
            session_id: SessionId::new(row.try_get("session_id")?),
            blob_key: row.try_get("blob_key")?,
            size_bytes: size.max(0) as u64,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Backup {
    pub id: BackupId,
    pub session_id: SessionId,
    pub blob_key: String,
    pub size_bytes: u64,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for Backup {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let size: i64 = row.try_get("size_bytes")?;
        Ok(Self {
            id: BackupId::new(row.try_get("id")?),
            session_id: SessionId::new(row.try_get("session_id")?),
            blob_key: row.try_get("blob_key")?,
            size_bytes: size.max(0) as u64,
            description: row.try_get("description")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
