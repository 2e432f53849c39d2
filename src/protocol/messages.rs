use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::room_code::{ParticipantId, RoomCode};
use super::state_event::StateEvent;
use crate::error::SignalError;

/// Events a participant sends to the signaling server.
///
/// WebRTC payloads (`offer`, `answer`, `candidate`) are opaque to the server
/// and relayed verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    CreateRoom {
        #[serde(default)]
        lesson_id: Option<String>,
        #[serde(default)]
        room_id: Option<String>,
    },
    JoinRoom {
        room_id: String,
    },
    WebrtcOffer {
        room_id: String,
        offer: Value,
    },
    WebrtcAnswer {
        room_id: String,
        answer: Value,
    },
    IceCandidate {
        room_id: String,
        candidate: Value,
    },
    StateUpdate {
        room_id: String,
        state_event: StateEvent,
    },
    LeaveRoom {
        room_id: String,
    },
}

impl ClientMessage {
    /// Event name as it appears on the wire, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::CreateRoom { .. } => "create-room",
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::WebrtcOffer { .. } => "webrtc-offer",
            ClientMessage::WebrtcAnswer { .. } => "webrtc-answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::StateUpdate { .. } => "state-update",
            ClientMessage::LeaveRoom { .. } => "leave-room",
        }
    }
}

/// Notifications the signaling server sends to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    RoomCreated {
        room_id: RoomCode,
    },
    CreateError {
        error: String,
        code: String,
    },
    RoomJoined {
        room_id: RoomCode,
        #[serde(default)]
        shared_state: Map<String, Value>,
    },
    JoinError {
        error: String,
        code: String,
    },
    PeerJoined {
        peer_id: ParticipantId,
        room_id: RoomCode,
    },
    PeerLeft {
        room_id: RoomCode,
        reason: String,
    },
    RoomClosed {
        room_id: RoomCode,
        reason: String,
    },
    WebrtcOffer {
        offer: Value,
        peer_id: ParticipantId,
    },
    WebrtcAnswer {
        answer: Value,
        peer_id: ParticipantId,
    },
    IceCandidate {
        candidate: Value,
        peer_id: ParticipantId,
    },
    StateUpdate {
        state_event: StateEvent,
    },
    Error {
        error: String,
    },
}

impl ServerMessage {
    pub fn create_error(err: &SignalError) -> Self {
        ServerMessage::CreateError {
            error: err.to_string(),
            code: err.code().to_string(),
        }
    }

    pub fn join_error(err: &SignalError) -> Self {
        ServerMessage::JoinError {
            error: err.to_string(),
            code: err.code().to_string(),
        }
    }
}
