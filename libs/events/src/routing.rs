//! Exchange names and routing-key layout.
//!
//! ```text
//! cmd.host.{server_id}.session.{start|stop|kill|input}   commands, host scoped
//! status.host.{server_id}                                host status
//! status.session.{session_id}                            session status
//! health.host.{server_id}                                heartbeats
//! manman.host.{status} / manman.host.stale               external
//! manman.session.{status}                                external
//! ```

use manman_id::{ServerId, SessionId};

use crate::error::EventError;
use crate::status::{ServerStatus, SessionStatus};

/// Default name of the internal topic exchange.
pub const INTERNAL_EXCHANGE: &str = "manman";

/// Default name of the external topic exchange.
pub const EXTERNAL_EXCHANGE: &str = "manman.external";

/// Binding patterns of the event processor's queue.
pub const PROCESSOR_BINDINGS: [&str; 3] = ["status.host.#", "status.session.#", "health.#"];

/// External routing key emitted once per host found stale by the sweep.
pub const HOST_STALE: &str = "manman.host.stale";

/// Session command kinds, encoded as the last routing-key segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Start,
    Stop,
    Kill,
    SendInput,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Kill => "kill",
            Self::SendInput => "input",
        }
    }

    /// Extracts the command kind from a full command routing key.
    pub fn from_routing_key(key: &str) -> Result<Self, EventError> {
        let segments: Vec<&str> = key.split('.').collect();
        match segments.as_slice() {
            ["cmd", "host", _, "session", action] => match *action {
                "start" => Ok(Self::Start),
                "stop" => Ok(Self::Stop),
                "kill" => Ok(Self::Kill),
                "input" => Ok(Self::SendInput),
                _ => Err(EventError::UnknownRoutingKey(key.to_string())),
            },
            _ => Err(EventError::UnknownRoutingKey(key.to_string())),
        }
    }
}

pub fn command(server_id: ServerId, kind: CommandKind) -> String {
    format!("cmd.host.{}.session.{}", server_id, kind.as_str())
}

/// Binding pattern for every command addressed to one host.
pub fn command_binding(server_id: ServerId) -> String {
    format!("cmd.host.{}.#", server_id)
}

pub fn host_status(server_id: ServerId) -> String {
    format!("status.host.{}", server_id)
}

pub fn session_status(session_id: SessionId) -> String {
    format!("status.session.{}", session_id)
}

pub fn health(server_id: ServerId) -> String {
    format!("health.host.{}", server_id)
}

pub fn external_host(status: ServerStatus) -> String {
    format!("manman.host.{}", status)
}

pub fn external_session(status: SessionStatus) -> String {
    format!("manman.session.{}", status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(host_status(ServerId::new(5)), "status.host.5");
        assert_eq!(session_status(SessionId::new(9)), "status.session.9");
        assert_eq!(health(ServerId::new(5)), "health.host.5");
        assert_eq!(external_host(ServerStatus::Offline), "manman.host.offline");
        assert_eq!(
            external_session(SessionStatus::Running),
            "manman.session.running"
        );
    }

    #[test]
    fn test_command_key_roundtrip() {
        for kind in [
            CommandKind::Start,
            CommandKind::Stop,
            CommandKind::Kill,
            CommandKind::SendInput,
        ] {
            let key = command(ServerId::new(3), kind);
            assert_eq!(CommandKind::from_routing_key(&key).unwrap(), kind);
        }
    }

    #[test]
    fn test_command_key_rejects_foreign_layouts() {
        assert!(CommandKind::from_routing_key("cmd.host.3.session.reboot").is_err());
        assert!(CommandKind::from_routing_key("status.session.3").is_err());
        assert!(CommandKind::from_routing_key("cmd.host.3.start").is_err());
    }
}
