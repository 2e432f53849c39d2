use thiserror::Error;

/// Error types for the signaling service and its clients
#[derive(Debug, Error)]
pub enum SignalError {
    /// Room registry errors
    #[error("Room {0} not found")]
    RoomNotFound(String),

    #[error("Room {0} is full")]
    RoomFull(String),

    #[error("Room code {0} already in use")]
    RoomCodeInUse(String),

    #[error("Invalid room code: {0}")]
    InvalidRoomCode(String),

    #[error("Participant is already in room {0}")]
    AlreadyInRoom(String),

    #[error("Role violation: {0}")]
    RoleViolation(String),

    /// Local media errors
    #[error("Microphone access denied: {0}")]
    MediaAccessDenied(String),

    /// Signaling errors
    #[error("Signaling transport error: {0}")]
    SignalingTransport(String),

    #[error("Negotiation out of order: {0}")]
    NegotiationOutOfOrder(String),

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// WebRTC API errors
    #[error("WebRTC API error: {0}")]
    WebRtcApi(String),

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigurationParseFailed(String),
}

/// Convenience type alias for Results using SignalError
pub type Result<T> = std::result::Result<T, SignalError>;

impl SignalError {
    /// Helper to create transport errors
    pub fn transport(msg: impl Into<String>) -> Self {
        SignalError::SignalingTransport(msg.into())
    }

    /// Helper to create role violations
    pub fn role(msg: impl Into<String>) -> Self {
        SignalError::RoleViolation(msg.into())
    }

    /// Stable machine-readable identifier sent next to the message in error events.
    pub fn code(&self) -> &'static str {
        match self {
            SignalError::RoomNotFound(_) => "room-not-found",
            SignalError::RoomFull(_) => "room-full",
            SignalError::RoomCodeInUse(_) => "room-code-in-use",
            SignalError::InvalidRoomCode(_) => "invalid-room-code",
            SignalError::AlreadyInRoom(_) => "already-in-room",
            SignalError::RoleViolation(_) => "role-violation",
            SignalError::MediaAccessDenied(_) => "media-access-denied",
            SignalError::SignalingTransport(_) => "signaling-transport",
            SignalError::NegotiationOutOfOrder(_) => "negotiation-out-of-order",
            SignalError::SerializationFailed(_) => "serialization-failed",
            SignalError::WebRtcApi(_) => "webrtc-api",
            SignalError::InvalidConfiguration(_) => "invalid-configuration",
            SignalError::ConfigurationParseFailed(_) => "configuration-parse-failed",
        }
    }

    /// Whether the user can act on this error at the join/create step.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            SignalError::RoomNotFound(_)
                | SignalError::RoomFull(_)
                | SignalError::RoomCodeInUse(_)
                | SignalError::InvalidRoomCode(_)
        )
    }
}

/// Convert webrtc::Error to SignalError
impl From<webrtc::Error> for SignalError {
    fn from(err: webrtc::Error) -> Self {
        SignalError::WebRtcApi(err.to_string())
    }
}
