//! Error types for message handling.

use thiserror::Error;

/// Errors that can occur when handling messages.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The message body could not be decoded.
    #[error("invalid message payload: {0}")]
    InvalidPayload(String),

    /// The routing key does not follow any known layout.
    #[error("unrecognized routing key: {0}")]
    UnknownRoutingKey(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
