use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::error::{Result, SignalError};
use crate::protocol::{ParticipantId, Role, RoomCode};

/// Lifetime limits applied to every room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomPolicy {
    /// Maximum age of a room regardless of activity.
    pub ttl: Duration,
    /// How long a disconnected tutor may take to reclaim the room.
    pub grace_period: Duration,
}

impl Default for RoomPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(2 * 60 * 60),
            grace_period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Room {
    pub code: RoomCode,
    pub tutor: ParticipantId,
    pub student: Option<ParticipantId>,
    pub created_at: Instant,
    pub lesson_id: Option<String>,
    pub shared_state: Map<String, Value>,
    pub tutor_disconnected: bool,
    pub student_disconnected: bool,
    tutor_absent_since: Option<Instant>,
}

impl Room {
    fn new(code: RoomCode, tutor: ParticipantId, lesson_id: Option<String>, now: Instant) -> Self {
        Self {
            code,
            tutor,
            student: None,
            created_at: now,
            lesson_id,
            shared_state: Map::new(),
            tutor_disconnected: false,
            student_disconnected: false,
            tutor_absent_since: None,
        }
    }

    pub fn role_of(&self, participant: &ParticipantId) -> Option<Role> {
        if &self.tutor == participant {
            Some(Role::Tutor)
        } else if self.student.as_ref() == Some(participant) {
            Some(Role::Student)
        } else {
            None
        }
    }

    /// The tutor's id, if the tutor slot is currently connected.
    pub fn connected_tutor(&self) -> Option<&ParticipantId> {
        (!self.tutor_disconnected).then_some(&self.tutor)
    }

    /// The student's id, if the student slot is occupied and connected.
    pub fn connected_student(&self) -> Option<&ParticipantId> {
        self.student.as_ref().filter(|_| !self.student_disconnected)
    }

    fn connected(&self, role: Role) -> Option<&ParticipantId> {
        match role {
            Role::Tutor => self.connected_tutor(),
            Role::Student => self.connected_student(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateDisposition {
    /// A fresh room was inserted.
    Created,
    /// A disconnected tutor slot was taken over. Carries the connected student, if any.
    Reclaimed { student: Option<ParticipantId> },
    /// The same tutor asked for its own room again.
    AlreadyOwned,
}

#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub code: RoomCode,
    pub disposition: CreateDisposition,
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub code: RoomCode,
    pub tutor: ParticipantId,
    pub tutor_connected: bool,
    pub shared_state: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectInfo {
    pub room_code: RoomCode,
    /// The counterpart, when it is still connected.
    pub other: Option<ParticipantId>,
    pub was_tutor: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    TutorTimedOut,
    Expired,
    TutorLeft,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::TutorTimedOut => f.write_str("Tutor did not reconnect"),
            CloseReason::Expired => f.write_str("Room expired"),
            CloseReason::TutorLeft => f.write_str("Tutor left"),
        }
    }
}

/// A room that has been removed, with the connected participants to notify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedRoom {
    pub code: RoomCode,
    pub notify: Vec<ParticipantId>,
    pub reason: CloseReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    Closed(ClosedRoom),
    StudentLeft {
        code: RoomCode,
        tutor: Option<ParticipantId>,
    },
}

/// Which slot a relayed message must come from and go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    TutorToStudent,
    StudentToTutor,
    ToOther,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub total_rooms: usize,
    /// Rooms with a student slot assigned.
    pub active_rooms: usize,
    pub waiting_rooms: usize,
}

#[derive(Debug, Clone)]
struct GraceCheck {
    code: RoomCode,
    due: Instant,
}

/// Authoritative in-memory store of live rooms.
///
/// All operations are synchronous and run to completion; callers serialize
/// access (the signaling server holds it behind a single lock).
pub struct RoomRegistry {
    policy: RoomPolicy,
    clock: Arc<dyn Clock>,
    rooms: HashMap<RoomCode, Room>,
    index: HashMap<ParticipantId, RoomCode>,
    pending: Vec<GraceCheck>,
}

impl RoomRegistry {
    pub fn new(policy: RoomPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            rooms: HashMap::new(),
            index: HashMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn policy(&self) -> RoomPolicy {
        self.policy
    }

    /// Create a room for a tutor, or reclaim/re-confirm a requested code
    pub fn create_room(
        &mut self,
        tutor: ParticipantId,
        lesson_id: Option<String>,
        requested: Option<&str>,
    ) -> Result<CreateOutcome> {
        let requested = requested
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(RoomCode::parse)
            .transpose()?;

        let reclaimable = requested.as_ref().filter(|code| {
            self.rooms
                .get(*code)
                .is_some_and(|room| room.tutor_disconnected)
        });

        if let Some(code) = &requested {
            let owned = self
                .rooms
                .get(code)
                .is_some_and(|room| room.tutor == tutor && !room.tutor_disconnected);
            if owned {
                tracing::debug!(
                    room_code = %code,
                    tutor_id = %tutor,
                    "Tutor re-requested own room"
                );
                return Ok(CreateOutcome {
                    code: code.clone(),
                    disposition: CreateDisposition::AlreadyOwned,
                });
            }
        }

        if let Some(bound) = self.index.get(&tutor) {
            if reclaimable != Some(bound) {
                return Err(SignalError::AlreadyInRoom(bound.to_string()));
            }
        }

        let now = self.clock.now();

        let code = match requested {
            Some(code) => match self.rooms.get_mut(&code) {
                Some(room) if room.tutor_disconnected => {
                    let previous = std::mem::replace(&mut room.tutor, tutor.clone());
                    room.tutor_disconnected = false;
                    room.tutor_absent_since = None;
                    let student = room.connected_student().cloned();

                    self.index.remove(&previous);
                    self.index.insert(tutor.clone(), code.clone());

                    tracing::info!(
                        room_code = %code,
                        tutor_id = %tutor,
                        previous_tutor_id = %previous,
                        "Tutor reclaimed room"
                    );
                    return Ok(CreateOutcome {
                        code,
                        disposition: CreateDisposition::Reclaimed { student },
                    });
                }
                Some(_) => return Err(SignalError::RoomCodeInUse(code.to_string())),
                None => code,
            },
            None => self.generate_unique_code(),
        };

        self.rooms
            .insert(code.clone(), Room::new(code.clone(), tutor.clone(), lesson_id, now));
        self.index.insert(tutor.clone(), code.clone());

        tracing::info!(room_code = %code, tutor_id = %tutor, "Room created");
        Ok(CreateOutcome {
            code,
            disposition: CreateDisposition::Created,
        })
    }

    fn generate_unique_code(&self) -> RoomCode {
        let mut rng = rand::thread_rng();
        loop {
            let code = RoomCode::generate(&mut rng);
            if !self.rooms.contains_key(&code) {
                return code;
            }
        }
    }

    /// Join an existing room as its student. Case-insensitive on the code.
    pub fn join_room(&mut self, student: ParticipantId, code: &str) -> Result<JoinOutcome> {
        let code = RoomCode::parse(code)
            .map_err(|_| SignalError::RoomNotFound(code.trim().to_string()))?;

        let bound = self.index.get(&student).cloned();

        let room = self
            .rooms
            .get_mut(&code)
            .ok_or_else(|| SignalError::RoomNotFound(code.to_string()))?;

        if room.tutor == student {
            return Err(SignalError::role("tutor cannot join its own room as student"));
        }

        if let Some(bound) = bound {
            if bound != code {
                return Err(SignalError::AlreadyInRoom(bound.to_string()));
            }
        }

        let replaced = match &room.student {
            Some(existing) if existing == &student => None,
            Some(_) if !room.student_disconnected => {
                return Err(SignalError::RoomFull(code.to_string()));
            }
            Some(existing) => Some(existing.clone()),
            None => None,
        };

        room.student = Some(student.clone());
        room.student_disconnected = false;

        let outcome = JoinOutcome {
            code: code.clone(),
            tutor: room.tutor.clone(),
            tutor_connected: !room.tutor_disconnected,
            shared_state: room.shared_state.clone(),
        };

        if let Some(previous) = &replaced {
            self.index.remove(previous);
        }
        self.index.insert(student.clone(), code.clone());

        tracing::info!(
            room_code = %code,
            student_id = %student,
            rejoined = replaced.is_some(),
            "Student joined room"
        );
        Ok(outcome)
    }

    /// Merge keys into the room's shared state. Only the room's tutor may write.
    pub fn update_state(
        &mut self,
        code: &str,
        from: &ParticipantId,
        patch: Map<String, Value>,
    ) -> Result<()> {
        let code = RoomCode::parse(code)
            .map_err(|_| SignalError::RoomNotFound(code.trim().to_string()))?;
        let room = self
            .rooms
            .get_mut(&code)
            .ok_or_else(|| SignalError::RoomNotFound(code.to_string()))?;

        if room.connected_tutor() != Some(from) {
            return Err(SignalError::role("only the room's tutor may update shared state"));
        }

        for (key, value) in patch {
            room.shared_state.insert(key, value);
        }
        Ok(())
    }

    /// Resolve the recipient of a relayed message.
    ///
    /// Returns `None` when the message is orphaned: unknown room, sender not
    /// connected in the required slot, or recipient absent.
    pub fn route(&self, code: &str, from: &ParticipantId, route: Route) -> Option<ParticipantId> {
        let code = RoomCode::parse(code).ok()?;
        let room = self.rooms.get(&code)?;
        let sender_role = room.role_of(from)?;
        room.connected(sender_role)?;

        let target = match (route, sender_role) {
            (Route::TutorToStudent, Role::Tutor) => Role::Student,
            (Route::StudentToTutor, Role::Student) => Role::Tutor,
            (Route::ToOther, Role::Tutor) => Role::Student,
            (Route::ToOther, Role::Student) => Role::Tutor,
            _ => return None,
        };

        room.connected(target).cloned()
    }

    /// Mark a participant's slot disconnected and schedule a grace re-check.
    ///
    /// Returns `None` for unknown participants and for slots already marked.
    pub fn handle_disconnect(&mut self, participant: &ParticipantId) -> Option<DisconnectInfo> {
        let code = self.index.get(participant)?.clone();
        let room = self.rooms.get_mut(&code)?;
        let now = self.clock.now();

        let info = match room.role_of(participant)? {
            Role::Tutor => {
                if room.tutor_disconnected {
                    return None;
                }
                room.tutor_disconnected = true;
                room.tutor_absent_since = Some(now);
                DisconnectInfo {
                    room_code: code.clone(),
                    other: room.connected_student().cloned(),
                    was_tutor: true,
                }
            }
            Role::Student => {
                if room.student_disconnected {
                    return None;
                }
                room.student_disconnected = true;
                DisconnectInfo {
                    room_code: code.clone(),
                    other: room.connected_tutor().cloned(),
                    was_tutor: false,
                }
            }
        };

        self.pending.push(GraceCheck {
            code: code.clone(),
            due: now + self.policy.grace_period,
        });

        tracing::info!(
            room_code = %code,
            participant_id = %participant,
            was_tutor = info.was_tutor,
            "Participant disconnected, grace period started"
        );
        Some(info)
    }

    /// Explicit leave. A tutor leaving closes the room; a student vacates its slot.
    pub fn leave_room(&mut self, participant: &ParticipantId, code: &str) -> Result<LeaveOutcome> {
        let code = RoomCode::parse(code)
            .map_err(|_| SignalError::RoomNotFound(code.trim().to_string()))?;
        let room = self
            .rooms
            .get_mut(&code)
            .ok_or_else(|| SignalError::RoomNotFound(code.to_string()))?;

        match room.role_of(participant) {
            Some(Role::Tutor) => {
                let closed = self
                    .remove_room(&code, CloseReason::TutorLeft, Some(participant))
                    .ok_or_else(|| SignalError::RoomNotFound(code.to_string()))?;
                Ok(LeaveOutcome::Closed(closed))
            }
            Some(Role::Student) => {
                room.student = None;
                room.student_disconnected = false;
                let tutor = room.connected_tutor().cloned();
                self.index.remove(participant);

                tracing::info!(room_code = %code, student_id = %participant, "Student left room");
                Ok(LeaveOutcome::StudentLeft { code, tutor })
            }
            None => Err(SignalError::role(format!("not a member of room {}", code))),
        }
    }

    /// Execute grace re-checks whose deadline has passed.
    ///
    /// A room is deleted only if its tutor is still absent and has been for
    /// at least the grace period.
    pub fn run_due_checks(&mut self) -> Vec<ClosedRoom> {
        let now = self.clock.now();
        let (due, pending): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|check| check.due <= now);
        self.pending = pending;

        let grace = self.policy.grace_period;
        let mut closed = Vec::new();

        for check in due {
            let expired = self.rooms.get(&check.code).is_some_and(|room| {
                room.tutor_disconnected
                    && room
                        .tutor_absent_since
                        .is_some_and(|since| now.duration_since(since) >= grace)
            });

            if expired {
                let removed = self.remove_room(&check.code, CloseReason::TutorTimedOut, None);
                if let Some(room) = removed {
                    tracing::info!(room_code = %room.code, "Tutor did not reconnect, room deleted");
                    closed.push(room);
                }
            }
        }

        closed
    }

    /// Delete every room older than the TTL.
    pub fn cleanup_expired(&mut self) -> Vec<ClosedRoom> {
        let now = self.clock.now();
        let ttl = self.policy.ttl;

        let expired: Vec<RoomCode> = self
            .rooms
            .values()
            .filter(|room| now.duration_since(room.created_at) > ttl)
            .map(|room| room.code.clone())
            .collect();

        let closed: Vec<ClosedRoom> = expired
            .iter()
            .filter_map(|code| self.remove_room(code, CloseReason::Expired, None))
            .collect();

        if !closed.is_empty() {
            tracing::info!(count = closed.len(), "Cleaned up expired rooms");
        }
        closed
    }

    fn remove_room(
        &mut self,
        code: &RoomCode,
        reason: CloseReason,
        initiator: Option<&ParticipantId>,
    ) -> Option<ClosedRoom> {
        let room = self.rooms.remove(code)?;

        let notify = room
            .connected_tutor()
            .into_iter()
            .chain(room.connected_student())
            .filter(|id| Some(*id) != initiator)
            .cloned()
            .collect();

        for id in std::iter::once(&room.tutor).chain(room.student.as_ref()) {
            if self.index.get(id) == Some(code) {
                self.index.remove(id);
            }
        }

        Some(ClosedRoom {
            code: room.code,
            notify,
            reason,
        })
    }

    pub fn stats(&self) -> RoomStats {
        let active_rooms = self.rooms.values().filter(|room| room.student.is_some()).count();
        RoomStats {
            total_rooms: self.rooms.len(),
            active_rooms,
            waiting_rooms: self.rooms.len() - active_rooms,
        }
    }

    pub fn get_room(&self, code: &RoomCode) -> Option<&Room> {
        self.rooms.get(code)
    }

    /// Room a participant is currently bound to
    pub fn room_of(&self, participant: &ParticipantId) -> Option<&RoomCode> {
        self.index.get(participant)
    }

    pub fn pending_checks(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn registry() -> (RoomRegistry, Arc<ManualClock>) {
        let clock = ManualClock::new();
        (RoomRegistry::new(RoomPolicy::default(), clock.clone()), clock)
    }

    fn pid(id: &str) -> ParticipantId {
        ParticipantId::from(id)
    }

    fn paired(registry: &mut RoomRegistry) -> RoomCode {
        let code = registry.create_room(pid("tutor-1"), None, None).unwrap().code;
        registry.join_room(pid("student-1"), code.as_str()).unwrap();
        code
    }

    #[test]
    fn test_create_room_generates_unique_codes() {
        let (mut registry, _) = registry();
        let mut seen = std::collections::HashSet::new();

        for i in 0..200 {
            let outcome = registry
                .create_room(pid(&format!("tutor-{}", i)), None, None)
                .unwrap();
            assert_eq!(outcome.disposition, CreateDisposition::Created);
            assert_eq!(outcome.code.as_str().len(), 6);
            assert!(seen.insert(outcome.code));
        }
        assert_eq!(registry.stats().total_rooms, 200);
    }

    #[test]
    fn test_create_with_requested_code_is_uppercased() {
        let (mut registry, _) = registry();
        let outcome = registry
            .create_room(pid("tutor-1"), Some("lesson-7".into()), Some("ab3d7k"))
            .unwrap();

        assert_eq!(outcome.code.as_str(), "AB3D7K");
        let room = registry.get_room(&outcome.code).unwrap();
        assert_eq!(room.lesson_id.as_deref(), Some("lesson-7"));
        assert_eq!(registry.room_of(&pid("tutor-1")), Some(&outcome.code));
    }

    #[test]
    fn test_create_rejects_malformed_requested_code() {
        let (mut registry, _) = registry();
        let err = registry
            .create_room(pid("tutor-1"), None, Some("NOPE0"))
            .unwrap_err();
        assert!(matches!(err, SignalError::InvalidRoomCode(_)));
        assert_eq!(registry.stats().total_rooms, 0);
    }

    #[test]
    fn test_create_is_idempotent_for_same_tutor() {
        let (mut registry, _) = registry();
        let first = registry
            .create_room(pid("tutor-1"), None, Some("AB3D7K"))
            .unwrap();
        let second = registry
            .create_room(pid("tutor-1"), None, Some("ab3d7k"))
            .unwrap();

        assert_eq!(first.code, second.code);
        assert_eq!(second.disposition, CreateDisposition::AlreadyOwned);
        assert_eq!(registry.stats().total_rooms, 1);
    }

    #[test]
    fn test_create_with_code_owned_by_connected_tutor_fails() {
        let (mut registry, _) = registry();
        registry
            .create_room(pid("tutor-1"), None, Some("AB3D7K"))
            .unwrap();

        let err = registry
            .create_room(pid("tutor-2"), None, Some("AB3D7K"))
            .unwrap_err();
        assert!(matches!(err, SignalError::RoomCodeInUse(code) if code == "AB3D7K"));

        let room = registry.get_room(&RoomCode::parse("AB3D7K").unwrap()).unwrap();
        assert_eq!(room.tutor, pid("tutor-1"));
    }

    #[test]
    fn test_tutor_cannot_hold_two_rooms() {
        let (mut registry, _) = registry();
        registry.create_room(pid("tutor-1"), None, None).unwrap();
        let err = registry.create_room(pid("tutor-1"), None, None).unwrap_err();
        assert!(matches!(err, SignalError::AlreadyInRoom(_)));
    }

    #[test]
    fn test_join_is_case_insensitive() {
        let (mut registry, _) = registry();
        registry
            .create_room(pid("tutor-1"), None, Some("AB3D7K"))
            .unwrap();

        let joined = registry.join_room(pid("student-1"), "ab3d7k").unwrap();
        assert_eq!(joined.code.as_str(), "AB3D7K");
        assert_eq!(joined.tutor, pid("tutor-1"));
        assert!(joined.tutor_connected);

        let stats = registry.stats();
        assert_eq!(stats.active_rooms, 1);
        assert_eq!(stats.waiting_rooms, 0);
    }

    #[test]
    fn test_join_unknown_room_does_not_mutate() {
        let (mut registry, _) = registry();
        registry.create_room(pid("tutor-1"), None, None).unwrap();
        let before = registry.stats();

        let err = registry.join_room(pid("student-1"), "ZZZZZZ").unwrap_err();
        assert!(matches!(err, SignalError::RoomNotFound(_)));
        let err = registry.join_room(pid("student-1"), "not a code").unwrap_err();
        assert!(matches!(err, SignalError::RoomNotFound(_)));

        assert_eq!(registry.stats(), before);
        assert!(registry.room_of(&pid("student-1")).is_none());
    }

    #[test]
    fn test_join_full_room_leaves_slot_unchanged() {
        let (mut registry, _) = registry();
        let code = paired(&mut registry);

        let err = registry.join_room(pid("student-2"), code.as_str()).unwrap_err();
        assert!(matches!(err, SignalError::RoomFull(_)));

        let room = registry.get_room(&code).unwrap();
        assert_eq!(room.student, Some(pid("student-1")));
        assert!(registry.room_of(&pid("student-2")).is_none());
    }

    #[test]
    fn test_same_student_rejoin_is_accepted() {
        let (mut registry, _) = registry();
        let code = paired(&mut registry);
        assert!(registry.join_room(pid("student-1"), code.as_str()).is_ok());
    }

    #[test]
    fn test_disconnected_student_slot_can_be_taken() {
        let (mut registry, _) = registry();
        let code = paired(&mut registry);

        let info = registry.handle_disconnect(&pid("student-1")).unwrap();
        assert!(!info.was_tutor);
        assert_eq!(info.other, Some(pid("tutor-1")));

        registry.join_room(pid("student-2"), code.as_str()).unwrap();
        let room = registry.get_room(&code).unwrap();
        assert_eq!(room.student, Some(pid("student-2")));
        assert!(!room.student_disconnected);
        assert!(registry.room_of(&pid("student-1")).is_none());
    }

    #[test]
    fn test_tutor_cannot_join_as_student() {
        let (mut registry, _) = registry();
        let code = registry.create_room(pid("tutor-1"), None, None).unwrap().code;
        let err = registry.join_room(pid("tutor-1"), code.as_str()).unwrap_err();
        assert!(matches!(err, SignalError::RoleViolation(_)));
    }

    #[test]
    fn test_student_cannot_join_second_room() {
        let (mut registry, _) = registry();
        paired(&mut registry);
        let other = registry.create_room(pid("tutor-2"), None, None).unwrap().code;

        let err = registry.join_room(pid("student-1"), other.as_str()).unwrap_err();
        assert!(matches!(err, SignalError::AlreadyInRoom(_)));
    }

    #[test]
    fn test_update_state_last_write_wins() {
        let (mut registry, _) = registry();
        let code = paired(&mut registry);

        let mut patch = Map::new();
        patch.insert("phase".into(), json!("grammar"));
        registry.update_state(code.as_str(), &pid("tutor-1"), patch).unwrap();

        let mut patch = Map::new();
        patch.insert("phase".into(), json!("practice"));
        patch.insert("lessonId".into(), json!("a1"));
        registry.update_state(code.as_str(), &pid("tutor-1"), patch).unwrap();

        let room = registry.get_room(&code).unwrap();
        assert_eq!(room.shared_state["phase"], json!("practice"));
        assert_eq!(room.shared_state["lessonId"], json!("a1"));

        let rejoined = registry.join_room(pid("student-1"), code.as_str()).unwrap();
        assert_eq!(rejoined.shared_state["phase"], json!("practice"));
    }

    #[test]
    fn test_update_state_from_student_is_rejected_without_mutation() {
        let (mut registry, _) = registry();
        let code = paired(&mut registry);

        let mut patch = Map::new();
        patch.insert("phase".into(), json!("review"));
        let err = registry
            .update_state(code.as_str(), &pid("student-1"), patch)
            .unwrap_err();

        assert!(matches!(err, SignalError::RoleViolation(_)));
        assert!(registry.get_room(&code).unwrap().shared_state.is_empty());
    }

    #[test]
    fn test_route_between_slots() {
        let (mut registry, _) = registry();
        let code = paired(&mut registry);
        let code = code.as_str();

        assert_eq!(
            registry.route(code, &pid("tutor-1"), Route::TutorToStudent),
            Some(pid("student-1"))
        );
        assert_eq!(
            registry.route(code, &pid("student-1"), Route::StudentToTutor),
            Some(pid("tutor-1"))
        );
        assert_eq!(
            registry.route(code, &pid("student-1"), Route::ToOther),
            Some(pid("tutor-1"))
        );
        assert_eq!(registry.route(code, &pid("student-1"), Route::TutorToStudent), None);
        assert_eq!(registry.route(code, &pid("tutor-1"), Route::StudentToTutor), None);
        assert_eq!(registry.route(code, &pid("stranger"), Route::ToOther), None);
    }

    #[test]
    fn test_route_drops_messages_for_disconnected_target() {
        let (mut registry, _) = registry();
        let code = paired(&mut registry);

        registry.handle_disconnect(&pid("student-1"));
        assert_eq!(
            registry.route(code.as_str(), &pid("tutor-1"), Route::ToOther),
            None
        );
    }

    #[test]
    fn test_repeated_disconnect_is_ignored() {
        let (mut registry, _) = registry();
        paired(&mut registry);

        assert!(registry.handle_disconnect(&pid("tutor-1")).is_some());
        assert!(registry.handle_disconnect(&pid("tutor-1")).is_none());
        assert!(registry.handle_disconnect(&pid("nobody")).is_none());
        assert_eq!(registry.pending_checks(), 1);
    }

    #[test]
    fn test_tutor_reclaims_within_grace_period() {
        let (mut registry, clock) = registry();
        let code = paired(&mut registry);

        let info = registry.handle_disconnect(&pid("tutor-1")).unwrap();
        assert!(info.was_tutor);
        assert_eq!(info.other, Some(pid("student-1")));

        clock.advance(Duration::from_secs(20));
        let outcome = registry
            .create_room(pid("tutor-2"), None, Some(code.as_str()))
            .unwrap();
        assert_eq!(outcome.code, code);
        assert_eq!(
            outcome.disposition,
            CreateDisposition::Reclaimed {
                student: Some(pid("student-1"))
            }
        );

        let room = registry.get_room(&code).unwrap();
        assert!(!room.tutor_disconnected);
        assert_eq!(room.tutor, pid("tutor-2"));
        assert!(registry.room_of(&pid("tutor-1")).is_none());

        clock.advance(Duration::from_secs(60));
        assert!(registry.run_due_checks().is_empty());
        assert!(registry.get_room(&code).is_some());
    }

    #[test]
    fn test_same_tutor_recreate_after_disconnect_reclaims() {
        let (mut registry, clock) = registry();
        let code = paired(&mut registry);

        registry.handle_disconnect(&pid("tutor-1")).unwrap();
        clock.advance(Duration::from_secs(5));

        let outcome = registry
            .create_room(pid("tutor-1"), None, Some(code.as_str()))
            .unwrap();
        assert_eq!(
            outcome.disposition,
            CreateDisposition::Reclaimed {
                student: Some(pid("student-1"))
            }
        );

        let room = registry.get_room(&code).unwrap();
        assert!(!room.tutor_disconnected);
        assert!(room.tutor_absent_since.is_none());
        assert_eq!(registry.room_of(&pid("tutor-1")), Some(&code));

        clock.advance(Duration::from_secs(61));
        assert!(registry.run_due_checks().is_empty());
        assert!(registry.get_room(&code).is_some());
    }

    #[test]
    fn test_unreclaimed_room_is_deleted_after_grace_period() {
        let (mut registry, clock) = registry();
        let code = paired(&mut registry);

        registry.handle_disconnect(&pid("tutor-1"));

        clock.advance(Duration::from_secs(59));
        assert!(registry.run_due_checks().is_empty());
        assert!(registry.get_room(&code).is_some());

        clock.advance(Duration::from_secs(1));
        let closed = registry.run_due_checks();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, CloseReason::TutorTimedOut);
        assert_eq!(closed[0].notify, vec![pid("student-1")]);

        assert!(registry.get_room(&code).is_none());
        assert!(registry.room_of(&pid("tutor-1")).is_none());
        assert!(registry.room_of(&pid("student-1")).is_none());
    }

    #[test]
    fn test_student_absence_alone_keeps_room() {
        let (mut registry, clock) = registry();
        let code = paired(&mut registry);

        registry.handle_disconnect(&pid("student-1"));
        clock.advance(Duration::from_secs(120));

        assert!(registry.run_due_checks().is_empty());
        let room = registry.get_room(&code).unwrap();
        assert!(room.student_disconnected);
    }

    #[test]
    fn test_student_check_does_not_shorten_later_tutor_absence() {
        let (mut registry, clock) = registry();
        let code = paired(&mut registry);

        registry.handle_disconnect(&pid("student-1"));
        clock.advance(Duration::from_secs(50));
        registry.handle_disconnect(&pid("tutor-1"));

        // student's check fires here; tutor has only been gone 10s
        clock.advance(Duration::from_secs(10));
        assert!(registry.run_due_checks().is_empty());
        assert!(registry.get_room(&code).is_some());

        clock.advance(Duration::from_secs(50));
        let closed = registry.run_due_checks();
        assert_eq!(closed.len(), 1);
        assert!(closed[0].notify.is_empty());
    }

    #[test]
    fn test_room_ttl_sweep() {
        let (mut registry, clock) = registry();
        let code = registry.create_room(pid("tutor-1"), None, None).unwrap().code;

        clock.advance(Duration::from_secs(119 * 60));
        assert!(registry.cleanup_expired().is_empty());
        assert!(registry.get_room(&code).is_some());

        clock.advance(Duration::from_secs(2 * 60));
        let closed = registry.cleanup_expired();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, CloseReason::Expired);
        assert_eq!(closed[0].notify, vec![pid("tutor-1")]);
        assert!(registry.get_room(&code).is_none());
        assert!(registry.room_of(&pid("tutor-1")).is_none());
    }

    #[test]
    fn test_expired_code_can_be_reused() {
        let (mut registry, clock) = registry();
        registry
            .create_room(pid("tutor-1"), None, Some("AB3D7K"))
            .unwrap();
        clock.advance(Duration::from_secs(3 * 60 * 60));
        registry.cleanup_expired();

        let outcome = registry
            .create_room(pid("tutor-2"), None, Some("AB3D7K"))
            .unwrap();
        assert_eq!(outcome.disposition, CreateDisposition::Created);
    }

    #[test]
    fn test_tutor_leave_closes_room() {
        let (mut registry, _) = registry();
        let code = paired(&mut registry);

        let outcome = registry.leave_room(&pid("tutor-1"), code.as_str()).unwrap();
        match outcome {
            LeaveOutcome::Closed(closed) => {
                assert_eq!(closed.reason, CloseReason::TutorLeft);
                assert_eq!(closed.notify, vec![pid("student-1")]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(registry.stats().total_rooms, 0);
        assert!(registry.room_of(&pid("student-1")).is_none());
    }

    #[test]
    fn test_student_leave_vacates_slot() {
        let (mut registry, _) = registry();
        let code = paired(&mut registry);

        let outcome = registry.leave_room(&pid("student-1"), code.as_str()).unwrap();
        assert_eq!(
            outcome,
            LeaveOutcome::StudentLeft {
                code: code.clone(),
                tutor: Some(pid("tutor-1"))
            }
        );
        assert_eq!(registry.stats().waiting_rooms, 1);
        assert!(registry.room_of(&pid("student-1")).is_none());

        registry.join_room(pid("student-2"), code.as_str()).unwrap();
    }

    #[test]
    fn test_leave_by_stranger_is_rejected() {
        let (mut registry, _) = registry();
        let code = paired(&mut registry);
        let err = registry.leave_room(&pid("stranger"), code.as_str()).unwrap_err();
        assert!(matches!(err, SignalError::RoleViolation(_)));
        assert_eq!(registry.stats().active_rooms, 1);
    }

    #[test]
    fn test_stats_serialize_for_health() {
        let (mut registry, _) = registry();
        paired(&mut registry);
        registry.create_room(pid("tutor-2"), None, None).unwrap();

        assert_eq!(
            serde_json::to_value(registry.stats()).unwrap(),
            json!({"totalRooms": 2, "activeRooms": 1, "waitingRooms": 1})
        );
    }
}
