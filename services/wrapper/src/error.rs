//! Wrapper errors and their gRPC status mapping.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WrapperError {
    #[error("process is already running")]
    AlreadyRunning,

    #[error("process is not running")]
    NotRunning,

    #[error("invalid launch request: {0}")]
    InvalidRequest(String),

    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to write config file {path}: {source}")]
    ConfigFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("signal delivery failed: {0}")]
    Signal(#[from] nix::Error),
}

impl From<WrapperError> for tonic::Status {
    fn from(err: WrapperError) -> Self {
        match &err {
            WrapperError::AlreadyRunning | WrapperError::NotRunning => {
                tonic::Status::failed_precondition(err.to_string())
            }
            WrapperError::InvalidRequest(_) => tonic::Status::invalid_argument(err.to_string()),
            WrapperError::Spawn(_)
            | WrapperError::ConfigFile { .. }
            | WrapperError::Io(_)
            | WrapperError::Signal(_) => tonic::Status::internal(err.to_string()),
        }
    }
}
