//! Bus and handler errors.

use manman_events::EventError;
use thiserror::Error;

/// Errors talking to the broker.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("publish not confirmed by broker")]
    NotConfirmed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outcome classes of a failed message handler.
///
/// A permanent failure is acknowledged and dropped: redelivering the same
/// message cannot succeed. A transient failure is requeued.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("permanent: {0}")]
    Permanent(String),

    #[error("transient: {0}")]
    Transient(String),
}

impl HandlerError {
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<EventError> for HandlerError {
    fn from(err: EventError) -> Self {
        Self::Permanent(err.to_string())
    }
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Serialization(e) => Self::Permanent(e.to_string()),
            other => Self::Transient(other.to_string()),
        }
    }
}
