//! manman Host Manager Library
//!
//! The host manager runs on each game host. It registers the host with the
//! control plane, turns session commands from the internal exchange into
//! Docker containers running the session wrapper, and reports what actually
//! happens back on the bus.
//!
//! ## Architecture
//!
//! - **Registration**: stable server name, resolved to a server id by the API
//! - **Commands**: a bus consumer dispatching start/stop/kill/input per session
//! - **Sessions**: one control path per session (Docker + wrapper gRPC)
//! - **State**: a local snapshot, written atomically, reconciled at startup
//! - **Heartbeat**: periodic `HealthUpdate` with per-status session counts

pub mod blob;
pub mod commands;
pub mod config;
pub mod control_plane;
pub mod docker;
pub mod error;
pub mod heartbeat;
pub mod runtime;
pub mod session;
pub mod state;
pub mod wrapper_client;

pub use blob::{BlobStore, FsBlobStore};
pub use commands::CommandHandler;
pub use control_plane::{ControlPlane, GrpcControlPlane, MockControlPlane};
pub use docker::DockerRuntime;
pub use error::SessionError;
pub use runtime::{ContainerRuntime, MockRuntime};
pub use session::{Collaborators, RecoveryReport, SessionManager, SessionSettings};
pub use state::{LocalStatus, SessionRecord, StateStore};
pub use wrapper_client::{GrpcWrapperClient, MockWrapper, WrapperApi};
