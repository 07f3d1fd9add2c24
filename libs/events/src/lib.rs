//! # manman-events
//!
//! Message schemas and the session state machine shared by the host manager
//! and the event processor.
//!
//! ## Design Principles
//!
//! - Message bodies are JSON; field names are part of the wire contract
//! - A session only ever moves along the edges of [`SessionStatus::check_transition`]
//! - External events are sanitized: they never carry parameters or secrets
//!
//! ## Exchanges
//!
//! - The internal topic exchange carries commands (`cmd.host.*`), status
//!   (`status.host.*`, `status.session.*`) and heartbeats (`health.*`)
//! - The external topic exchange carries `manman.host.*` and `manman.session.*`
//!   notifications for downstream consumers

mod error;
mod external;
mod messages;
pub mod routing;
mod status;

pub use error::EventError;
pub use external::*;
pub use messages::*;
pub use status::*;

/// Decodes a JSON message body.
///
/// Any decoding failure is reported as [`EventError::InvalidPayload`]; a
/// malformed body never becomes valid on redelivery.
pub fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, EventError> {
    serde_json::from_slice(body).map_err(|e| EventError::InvalidPayload(e.to_string()))
}

/// Encodes a message body as JSON.
pub fn encode<T: serde::Serialize>(message: &T) -> Result<Vec<u8>, EventError> {
    serde_json::to_vec(message).map_err(EventError::from)
}
