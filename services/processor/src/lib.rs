//! manman Event Processor Library
//!
//! Consumes host and session status from the internal exchange, enforces the
//! session state machine against the database, and republishes sanitized
//! events on the external exchange.
//!
//! ## Architecture
//!
//! - **Registry**: routes each message to the one handler whose topic pattern claims it
//! - **Handlers**: session transitions, host status, heartbeats
//! - **Sweep**: marks hosts offline when their heartbeats stop
//! - **External**: best-effort republishing that never fails a handler

pub mod config;
pub mod external;
pub mod handlers;
pub mod store;
pub mod sweep;

pub use external::ExternalPublisher;
pub use handlers::{EventHandler, HandlerRegistry};
pub use store::{MemoryStore, PgStore, ProcessorStore};
pub use sweep::{StaleSweeper, SweepConfig};
