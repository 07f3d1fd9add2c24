//! # manman-wrapper
//!
//! Runs inside every session container. It owns exactly one game process and
//! exposes it to the host manager over the `WrapperControl` gRPC service:
//! start and stop it, write to its stdin, read its status, and stream its
//! output to any number of subscribers.

pub mod config;
pub mod error;
pub mod service;
pub mod supervisor;

pub use error::WrapperError;
pub use service::WrapperService;
pub use supervisor::{LaunchSpec, OutputEvent, ProcessStatus, ProcessSupervisor, RunState};
