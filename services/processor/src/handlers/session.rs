//! Session status updates.
//!
//! [`decide`] is a pure function of the persisted status and the update; it
//! names the single compare-and-set write to perform. Redelivery of an update
//! that was already applied decides [`Decision::AlreadyApplied`] and writes
//! nothing.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use manman_bus::HandlerError;
use manman_events::{
    decode, ExternalEvent, ExternalSessionEvent, SessionStatus, SessionStatusUpdate,
    TransitionCheck,
};
use manman_store::Session;
use tracing::{debug, info, instrument, warn};

use super::{storage_error, EventHandler};
use crate::external::ExternalPublisher;
use crate::store::ProcessorStore;

/// The write implied by a valid transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionWrite {
    Status {
        from: SessionStatus,
        to: SessionStatus,
    },
    /// Entering `running`; records `started_at`.
    Start { from: SessionStatus },
    /// Entering a terminal status; records `ended_at` and the exit code.
    End {
        from: SessionStatus,
        status: SessionStatus,
        exit_code: Option<i32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Apply(SessionWrite),
    AlreadyApplied,
    Invalid {
        from: SessionStatus,
        to: SessionStatus,
    },
}

pub fn decide(current: SessionStatus, update: &SessionStatusUpdate) -> Decision {
    let to = update.status;
    match current.check_transition(to) {
        TransitionCheck::AlreadyApplied => Decision::AlreadyApplied,
        TransitionCheck::Invalid => Decision::Invalid { from: current, to },
        TransitionCheck::Valid if to == SessionStatus::Running => {
            Decision::Apply(SessionWrite::Start { from: current })
        }
        TransitionCheck::Valid if to.is_terminal() => Decision::Apply(SessionWrite::End {
            from: current,
            status: to,
            exit_code: update.exit_code,
        }),
        TransitionCheck::Valid => Decision::Apply(SessionWrite::Status { from: current, to }),
    }
}

/// The sanitized external view of a session row.
pub fn session_event(session: &Session) -> ExternalEvent {
    ExternalEvent::Session(ExternalSessionEvent {
        session_id: session.id,
        sgc_id: session.sgc_id,
        status: session.status,
        exit_code: session.exit_code,
        started_at: session.started_at,
        ended_at: session.ended_at,
        occurred_at: Utc::now(),
    })
}

pub struct SessionStatusHandler {
    pattern: &'static str,
    store: Arc<dyn ProcessorStore>,
    external: ExternalPublisher,
}

impl SessionStatusHandler {
    pub fn new(
        pattern: &'static str,
        store: Arc<dyn ProcessorStore>,
        external: ExternalPublisher,
    ) -> Self {
        Self {
            pattern,
            store,
            external,
        }
    }

    async fn apply(
        &self,
        update: &SessionStatusUpdate,
        write: SessionWrite,
    ) -> Result<Option<Session>, HandlerError> {
        let id = update.session_id;
        let result = match write {
            SessionWrite::Status { from, to } => {
                self.store.update_session_status(id, from, to).await
            }
            SessionWrite::Start { from } => self.store.update_session_start(id, from).await,
            SessionWrite::End {
                from,
                status,
                exit_code,
            } => {
                self.store
                    .update_session_end(id, from, status, exit_code)
                    .await
            }
        };
        result.map_err(storage_error)
    }
}

#[async_trait]
impl EventHandler for SessionStatusHandler {
    fn name(&self) -> &'static str {
        "session_status"
    }

    fn pattern(&self) -> &'static str {
        self.pattern
    }

    #[instrument(skip(self, body))]
    async fn handle(&self, routing_key: &str, body: &[u8]) -> Result<(), HandlerError> {
        let update: SessionStatusUpdate = decode(body)?;
        let id = update.session_id;

        let session = self
            .store
            .get_session(id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| HandlerError::permanent(format!("session {id} not found")))?;

        let write = match decide(session.status, &update) {
            Decision::AlreadyApplied => {
                debug!(session_id = %id, status = %update.status, "Transition already applied");
                return Ok(());
            }
            Decision::Invalid { from, to } => {
                warn!(session_id = %id, %from, %to, "Rejecting invalid session transition");
                return Err(HandlerError::permanent(format!(
                    "invalid session transition {from} -> {to} for session {id}"
                )));
            }
            Decision::Apply(write) => write,
        };

        let Some(updated) = self.apply(&update, write).await? else {
            // The row moved between the read and the write.
            let current = self.store.get_session(id).await.map_err(storage_error)?;
            if current.is_some_and(|s| s.status == update.status) {
                return Ok(());
            }
            return Err(HandlerError::transient(format!(
                "session {id} changed concurrently"
            )));
        };

        info!(
            session_id = %id,
            from = %session.status,
            to = %updated.status,
            exit_code = ?updated.exit_code,
            "Session transition applied"
        );
        self.external.publish(&session_event(&updated)).await;
        Ok(())
    }
}
