//! Session control errors and their bus classification.

use manman_bus::{BusError, HandlerError};
use manman_id::SessionId;
use manman_params::ParamError;
use thiserror::Error;

use crate::runtime::RuntimeError;
use crate::state::StateError;
use crate::wrapper_client::WrapperClientError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} is not known on this host")]
    UnknownSession(SessionId),

    #[error("session {session_id} is {status}, expected running")]
    NotRunning {
        session_id: SessionId,
        status: &'static str,
    },

    #[error("another session of this server game config is active: {0}")]
    SgcBusy(SessionId),

    #[error("invalid parameters: {0}")]
    Params(#[from] ParamError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Wrapper(#[from] WrapperClientError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl SessionError {
    /// Returns true if redelivering the command may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Runtime(e) => e.is_transient(),
            Self::Wrapper(e) => matches!(e, WrapperClientError::Unavailable(_)),
            Self::State(_) | Self::Bus(_) => true,
            Self::UnknownSession(_) | Self::NotRunning { .. } | Self::SgcBusy(_) | Self::Params(_) => {
                false
            }
        }
    }
}

impl From<SessionError> for HandlerError {
    fn from(err: SessionError) -> Self {
        if err.is_transient() {
            HandlerError::Transient(err.to_string())
        } else {
            HandlerError::Permanent(err.to_string())
        }
    }
}
