//! Sanitized events republished on the external exchange.
//!
//! Downstream consumers only ever see identifiers, statuses and timestamps.
//! Launch parameters (which may contain secrets) never leave the internal
//! exchange.

use chrono::{DateTime, Utc};
use manman_id::{ServerId, SessionId, SgcId};
use serde::{Deserialize, Serialize};

use crate::routing;
use crate::status::{ServerStatus, SessionStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalSessionEvent {
    pub session_id: SessionId,
    pub sgc_id: SgcId,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalHostEvent {
    pub server_id: ServerId,
    pub name: String,
    pub status: ServerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

/// An event bound for the external exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalEvent {
    Session(ExternalSessionEvent),
    Host(ExternalHostEvent),
    /// Emitted by the stale sweep, once per host it marks offline.
    HostStale(ExternalHostEvent),
}

impl ExternalEvent {
    pub fn routing_key(&self) -> String {
        match self {
            Self::Session(e) => routing::external_session(e.status),
            Self::Host(e) => routing::external_host(e.status),
            Self::HostStale(_) => routing::HOST_STALE.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Session(e) => serde_json::to_vec(e),
            Self::Host(e) | Self::HostStale(e) => serde_json::to_vec(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_event(status: ServerStatus) -> ExternalHostEvent {
        ExternalHostEvent {
            server_id: ServerId::new(1),
            name: "node-a-prod".to_string(),
            status,
            last_seen: None,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn test_routing_keys() {
        assert_eq!(
            ExternalEvent::Host(host_event(ServerStatus::Offline)).routing_key(),
            "manman.host.offline"
        );
        assert_eq!(
            ExternalEvent::HostStale(host_event(ServerStatus::Offline)).routing_key(),
            "manman.host.stale"
        );
    }

    #[test]
    fn test_session_event_json() {
        let event = ExternalEvent::Session(ExternalSessionEvent {
            session_id: SessionId::new(1),
            sgc_id: SgcId::new(2),
            status: SessionStatus::Stopped,
            exit_code: Some(0),
            started_at: None,
            ended_at: None,
            occurred_at: Utc::now(),
        });
        assert_eq!(event.routing_key(), "manman.session.stopped");

        let json: serde_json::Value = serde_json::from_slice(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["exit_code"], 0);
        assert!(json.get("started_at").is_none());
    }
}
