use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LessonPhase {
    Introduction,
    Grammar,
    Vocabulary,
    Practice,
    Assessment,
    Review,
}

/// Application state change broadcast from tutor to student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateEvent {
    ChangePhase {
        phase: LessonPhase,
    },
    AddWhiteboardNote {
        note: String,
    },
    RemoveWhiteboardNote {
        index: usize,
    },
    ClearWhiteboard,
    TriggerFlashcard {
        #[serde(rename = "noteIndex")]
        note_index: usize,
    },
    UpdateLesson {
        #[serde(rename = "lessonId")]
        lesson_id: String,
    },
    EndSession,
}

/// Discriminant of a [`StateEvent`], used as a subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEventKind {
    ChangePhase,
    AddWhiteboardNote,
    RemoveWhiteboardNote,
    ClearWhiteboard,
    TriggerFlashcard,
    UpdateLesson,
    EndSession,
}

impl StateEvent {
    pub fn kind(&self) -> StateEventKind {
        match self {
            StateEvent::ChangePhase { .. } => StateEventKind::ChangePhase,
            StateEvent::AddWhiteboardNote { .. } => StateEventKind::AddWhiteboardNote,
            StateEvent::RemoveWhiteboardNote { .. } => StateEventKind::RemoveWhiteboardNote,
            StateEvent::ClearWhiteboard => StateEventKind::ClearWhiteboard,
            StateEvent::TriggerFlashcard { .. } => StateEventKind::TriggerFlashcard,
            StateEvent::UpdateLesson { .. } => StateEventKind::UpdateLesson,
            StateEvent::EndSession => StateEventKind::EndSession,
        }
    }

    /// Keys merged into a room's shared state when this event is relayed.
    ///
    /// `lastUpdate` always carries the whole event; phase, lesson and end
    /// markers get their own keys so a reconnecting student can restore them
    /// even after later whiteboard traffic.
    pub fn shared_state_patch(&self) -> Map<String, Value> {
        let mut patch = Map::new();
        if let Ok(event) = serde_json::to_value(self) {
            patch.insert("lastUpdate".to_string(), event);
        }

        match self {
            StateEvent::ChangePhase { phase } => {
                if let Ok(phase) = serde_json::to_value(phase) {
                    patch.insert("phase".to_string(), phase);
                }
            }
            StateEvent::UpdateLesson { lesson_id } => {
                patch.insert("lessonId".to_string(), Value::String(lesson_id.clone()));
            }
            StateEvent::EndSession => {
                patch.insert("ended".to_string(), Value::Bool(true));
            }
            StateEvent::AddWhiteboardNote { .. }
            | StateEvent::RemoveWhiteboardNote { .. }
            | StateEvent::ClearWhiteboard
            | StateEvent::TriggerFlashcard { .. } => {}
        }

        patch
    }
}
