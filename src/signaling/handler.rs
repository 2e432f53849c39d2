use std::sync::Arc;

use super::server::{Outbound, SignalingServer};
use crate::protocol::{ClientMessage, ParticipantId, ServerMessage};

/// One participant's view of the signaling server, bound to a single connection.
pub struct SignalingHandler {
    server: Arc<SignalingServer>,
    participant: ParticipantId,
    outbound: Outbound,
}

impl SignalingHandler {
    /// Assigns a fresh participant id and registers the outbound channel.
    pub async fn connect(server: Arc<SignalingServer>, outbound: Outbound) -> Self {
        let participant = ParticipantId::generate();
        server.register(participant.clone(), outbound.clone()).await;
        tracing::info!(participant_id = %participant, "Participant connected");

        Self {
            server,
            participant,
            outbound,
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub async fn handle_message(&self, message: ClientMessage) {
        self.server.handle_message(&self.participant, message).await;
    }

    /// Report a frame that could not be decoded back to this participant only.
    pub fn reject(&self, error: impl Into<String>) {
        let message = ServerMessage::Error {
            error: error.into(),
        };
        if self.outbound.send(message).is_err() {
            tracing::debug!(participant_id = %self.participant, "Outbound channel closed");
        }
    }

    pub async fn cleanup(self) {
        self.server.handle_disconnect(&self.participant).await;
        tracing::info!(participant_id = %self.participant, "Participant disconnected");
    }
}
