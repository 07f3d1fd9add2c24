//! # manman-proto
//!
//! gRPC contracts.
//!
//! - [`wrapper::v1`]: `WrapperControl`, served by the in-container wrapper and
//!   called by the host manager
//! - [`api::v1`]: the subset of the control-plane API that host
//!   managers call

pub mod api;
pub mod wrapper;
