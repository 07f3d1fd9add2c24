//! Internal exchange message bodies.
//!
//! Commands flow from the control plane to a host manager; status and health
//! updates flow from host managers to the event processor.

use std::collections::BTreeMap;

use manman_id::{GameConfigId, GameId, ServerId, SessionId, SgcId};
use manman_params::{ParamDefinition, ParamValues};
use serde::{Deserialize, Serialize};

use crate::status::{ServerStatus, SessionStatus};

// =============================================================================
// Launch templates
// =============================================================================

/// Transport protocol of a port binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file rendered into the container before the game starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTemplate {
    /// Absolute path inside the container.
    pub path: String,
    /// Template body; `{{name}}` placeholders are substituted.
    pub content: String,
}

/// The static launch template of a game.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfigSpec {
    pub game_config_id: GameConfigId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<GameId>,
    pub name: String,
    pub image: String,
    /// Executable inside the image.
    pub command: String,
    #[serde(default)]
    pub args_template: Vec<String>,
    #[serde(default)]
    pub env_template: BTreeMap<String, String>,
    #[serde(default)]
    pub files: Vec<FileTemplate>,
    #[serde(default)]
    pub parameters: Vec<ParamDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// A container port published on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    /// 0 leaves the choice to the allocator when the SGC is created.
    #[serde(default)]
    pub host_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortBinding {
    pub fn is_unpinned(&self) -> bool {
        self.host_port == 0
    }
}

/// Binding of a game config to one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerGameConfigSpec {
    pub sgc_id: SgcId,
    pub server_id: ServerId,
    #[serde(default)]
    pub port_bindings: Vec<PortBinding>,
    #[serde(default)]
    pub parameters: ParamValues,
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionCommand {
    pub session_id: SessionId,
    pub sgc_id: SgcId,
    pub game_config: GameConfigSpec,
    pub server_game_config: ServerGameConfigSpec,
    /// Per-session overrides; they win over the SGC parameters.
    #[serde(default)]
    pub parameters: ParamValues,
    /// Kill any other session of the same SGC before starting.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopSessionCommand {
    pub session_id: SessionId,
    /// Skip the graceful phase.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSessionCommand {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendInputCommand {
    pub session_id: SessionId,
    /// Written verbatim to the game's standard input.
    pub input: String,
}

// =============================================================================
// Status and Health
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStatusUpdate {
    pub server_id: ServerId,
    pub status: ServerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusUpdate {
    pub session_id: SessionId,
    pub sgc_id: SgcId,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Per-status session counts reported with every heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStats {
    pub total: u32,
    pub starting: u32,
    pub running: u32,
    pub stopping: u32,
    pub stopped: u32,
    pub crashed: u32,
    pub lost: u32,
    /// Sessions that have been `starting` for longer than the host's timeout.
    pub stuck_starting: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthUpdate {
    pub server_id: ServerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_stats: Option<SessionStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_command_minimal_json() {
        let json = r#"{
            "session_id": 1,
            "sgc_id": 1,
            "game_config": {
                "game_config_id": 3,
                "name": "vanilla",
                "image": "itzg/minecraft-server:latest",
                "command": "/start"
            },
            "server_game_config": {"sgc_id": 1, "server_id": 2}
        }"#;

        let cmd: StartSessionCommand = serde_json::from_str(json).unwrap();
        assert_eq!(cmd.session_id, SessionId::new(1));
        assert!(!cmd.force);
        assert!(cmd.parameters.is_empty());
        assert!(cmd.game_config.args_template.is_empty());
        assert!(cmd.server_game_config.port_bindings.is_empty());
    }

    #[test]
    fn test_session_status_update_omits_missing_exit_code() {
        let update = SessionStatusUpdate {
            session_id: SessionId::new(1),
            sgc_id: SgcId::new(1),
            status: SessionStatus::Running,
            exit_code: None,
        };
        let json = serde_json::to_string(&update).unwrap();
        assert_eq!(json, r#"{"session_id":1,"sgc_id":1,"status":"running"}"#);
    }

    #[test]
    fn test_health_update_with_stats() {
        let update = HealthUpdate {
            server_id: ServerId::new(4),
            session_stats: Some(SessionStats {
                total: 2,
                running: 1,
                starting: 1,
                ..Default::default()
            }),
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["session_stats"]["running"], 1);

        let parsed: HealthUpdate = serde_json::from_str(r#"{"server_id":4}"#).unwrap();
        assert!(parsed.session_stats.is_none());
    }

    #[test]
    fn test_port_binding_protocol_defaults_to_tcp() {
        let binding: PortBinding =
            serde_json::from_str(r#"{"container_port":25565,"host_port":25565}"#).unwrap();
        assert_eq!(binding.protocol, Protocol::Tcp);
        assert_eq!(Protocol::parse("UDP"), Some(Protocol::Udp));
    }
}
