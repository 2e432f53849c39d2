//! Wire vocabulary shared by the server and its clients.

mod messages;
mod room_code;
mod state_event;

pub use messages::{ClientMessage, ServerMessage};
pub use room_code::{ParticipantId, RoomCode, ROOM_CODE_ALPHABET, ROOM_CODE_LEN};
pub use state_event::{LessonPhase, StateEvent, StateEventKind};

use serde::{Deserialize, Serialize};

/// Which side of the lesson a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Tutor,
    Student,
}

impl Role {
    pub fn is_tutor(self) -> bool {
        matches!(self, Role::Tutor)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Tutor => f.write_str("tutor"),
            Role::Student => f.write_str("student"),
        }
    }
}
