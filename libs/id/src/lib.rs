//! # manman-id
//!
//! Typed integer IDs for the entities persisted by the control plane.
//!
//! Every entity row is keyed by a Postgres `BIGSERIAL`. The raw `i64` is
//! wrapped in a newtype per entity so a `SessionId` can never be passed where a
//! `ServerId` is expected. On the wire the IDs stay plain JSON numbers, which
//! keeps the message contract (`{"session_id": 1}`) unchanged.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
