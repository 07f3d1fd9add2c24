//! Dispatch of session commands consumed from the internal exchange.

use std::sync::Arc;

use async_trait::async_trait;
use manman_bus::{DeliveryHandler, HandlerError};
use manman_events::routing::CommandKind;
use manman_events::{
    decode, KillSessionCommand, SendInputCommand, StartSessionCommand, StopSessionCommand,
};
use tracing::debug;

use crate::session::SessionManager;

pub struct CommandHandler {
    sessions: Arc<SessionManager>,
}

impl CommandHandler {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl DeliveryHandler for CommandHandler {
    async fn handle(&self, routing_key: &str, body: &[u8]) -> Result<(), HandlerError> {
        let kind = CommandKind::from_routing_key(routing_key)?;
        debug!(routing_key, command = kind.as_str(), "Handling command");

        match kind {
            CommandKind::Start => {
                let cmd: StartSessionCommand = decode(body)?;
                self.sessions.start(cmd).await?;
            }
            CommandKind::Stop => {
                let cmd: StopSessionCommand = decode(body)?;
                self.sessions.stop(cmd).await?;
            }
            CommandKind::Kill => {
                let cmd: KillSessionCommand = decode(body)?;
                self.sessions.kill(cmd).await?;
            }
            CommandKind::SendInput => {
                let cmd: SendInputCommand = decode(body)?;
                self.sessions.send_input(cmd).await?;
            }
        }
        Ok(())
    }
}
