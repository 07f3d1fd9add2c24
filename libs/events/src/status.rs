//! Session and server status values and the session transition table.

use serde::{Deserialize, Serialize};

/// Session status as persisted by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created by the API, not yet picked up by a host.
    Pending,
    /// The host manager is creating the container and starting the wrapper.
    Starting,
    /// The game process is running.
    Running,
    /// A stop was requested and is in progress.
    Stopping,
    /// Stopped on request.
    Stopped,
    /// Exited without being asked to, or failed to start.
    Crashed,
    /// Finished on its own. Terminal, but no processor edge reaches it.
    Completed,
}

/// Outcome of checking a requested status change against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCheck {
    /// The edge exists; the change must be applied.
    Valid,
    /// The session is already in the requested status (duplicate delivery).
    AlreadyApplied,
    /// The edge does not exist.
    Invalid,
}

impl SessionStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [SessionStatus; 7] = [
        Self::Pending,
        Self::Starting,
        Self::Running,
        Self::Stopping,
        Self::Stopped,
        Self::Crashed,
        Self::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "crashed" => Some(Self::Crashed),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Returns true for statuses a session never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed | Self::Completed)
    }

    /// Returns true while the session holds host resources.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Returns true if `self -> to` is an edge of the state machine:
    ///
    /// ```text
    /// pending → starting → running → stopping → stopped
    ///             ↓           ↓          ↓
    ///           crashed    crashed    crashed
    /// ```
    pub fn can_transition_to(&self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Pending, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Starting, Crashed)
                | (Running, Crashed)
                | (Stopping, Crashed)
        )
    }

    /// Classifies a requested change from `self` to `to`.
    pub fn check_transition(&self, to: SessionStatus) -> TransitionCheck {
        if *self == to {
            TransitionCheck::AlreadyApplied
        } else if self.can_transition_to(to) {
            TransitionCheck::Valid
        } else {
            TransitionCheck::Invalid
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server (host) status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Online,
    Offline,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    const EDGES: [(SessionStatus, SessionStatus); 7] = [
        (SessionStatus::Pending, SessionStatus::Starting),
        (SessionStatus::Starting, SessionStatus::Running),
        (SessionStatus::Running, SessionStatus::Stopping),
        (SessionStatus::Stopping, SessionStatus::Stopped),
        (SessionStatus::Starting, SessionStatus::Crashed),
        (SessionStatus::Running, SessionStatus::Crashed),
        (SessionStatus::Stopping, SessionStatus::Crashed),
    ];

    fn any_status() -> impl Strategy<Value = SessionStatus> {
        proptest::sample::select(SessionStatus::ALL.to_vec())
    }

    #[rstest]
    #[case(SessionStatus::Pending, SessionStatus::Starting)]
    #[case(SessionStatus::Starting, SessionStatus::Running)]
    #[case(SessionStatus::Running, SessionStatus::Stopping)]
    #[case(SessionStatus::Stopping, SessionStatus::Stopped)]
    #[case(SessionStatus::Starting, SessionStatus::Crashed)]
    #[case(SessionStatus::Running, SessionStatus::Crashed)]
    #[case(SessionStatus::Stopping, SessionStatus::Crashed)]
    fn test_table_edges_are_valid(#[case] from: SessionStatus, #[case] to: SessionStatus) {
        assert_eq!(from.check_transition(to), TransitionCheck::Valid);
    }

    #[rstest]
    #[case(SessionStatus::Pending, SessionStatus::Running)]
    #[case(SessionStatus::Pending, SessionStatus::Crashed)]
    #[case(SessionStatus::Running, SessionStatus::Starting)]
    #[case(SessionStatus::Running, SessionStatus::Stopped)]
    #[case(SessionStatus::Stopped, SessionStatus::Running)]
    #[case(SessionStatus::Crashed, SessionStatus::Stopping)]
    #[case(SessionStatus::Running, SessionStatus::Completed)]
    fn test_shortcuts_and_reversals_are_invalid(
        #[case] from: SessionStatus,
        #[case] to: SessionStatus,
    ) {
        assert_eq!(from.check_transition(to), TransitionCheck::Invalid);
    }

    #[test]
    fn test_terminal_statuses_have_no_outgoing_edges() {
        for from in SessionStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in SessionStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in SessionStatus::ALL {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert_eq!(ServerStatus::parse("online"), Some(ServerStatus::Online));
        assert_eq!(ServerStatus::parse("lost"), None);
    }

    proptest! {
        #[test]
        fn prop_only_table_edges_are_valid(from in any_status(), to in any_status()) {
            let in_table = EDGES.contains(&(from, to));
            let check = from.check_transition(to);
            if from == to {
                prop_assert_eq!(check, TransitionCheck::AlreadyApplied);
            } else if in_table {
                prop_assert_eq!(check, TransitionCheck::Valid);
            } else {
                prop_assert_eq!(check, TransitionCheck::Invalid);
            }
        }

        #[test]
        fn prop_same_status_is_never_an_edge(status in any_status()) {
            prop_assert!(!status.can_transition_to(status));
        }
    }
}
