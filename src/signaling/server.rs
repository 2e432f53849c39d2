use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::registry::{
    ClosedRoom, CreateDisposition, LeaveOutcome, RoomRegistry, RoomStats, Route,
};
use crate::clock::Clock;
use crate::config::RoomConfig;
use crate::protocol::{ClientMessage, ParticipantId, ServerMessage};

pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// Relays signaling traffic between the two participants of each room.
///
/// Every registry operation and the notifications it produces run under the
/// registry write lock, so operations are applied one at a time and
/// notifications for one room leave in the order they were decided.
pub struct SignalingServer {
    registry: Arc<RwLock<RoomRegistry>>,
    connections: Arc<RwLock<HashMap<ParticipantId, Outbound>>>,
    rooms: RoomConfig,
}

impl SignalingServer {
    pub fn new(rooms: RoomConfig, clock: Arc<dyn Clock>) -> Self {
        let registry = RoomRegistry::new(rooms.policy(), clock);
        Self::with_registry(registry, rooms)
    }

    pub fn with_registry(registry: RoomRegistry, rooms: RoomConfig) -> Self {
        Self {
            registry: Arc::new(RwLock::new(registry)),
            connections: Arc::new(RwLock::new(HashMap::new())),
            rooms,
        }
    }

    pub fn registry(&self) -> Arc<RwLock<RoomRegistry>> {
        self.registry.clone()
    }

    pub async fn register(&self, participant: ParticipantId, sender: Outbound) {
        tracing::debug!(participant_id = %participant, "Connection registered");
        self.connections.write().await.insert(participant, sender);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn stats(&self) -> RoomStats {
        self.registry.read().await.stats()
    }

    async fn send(&self, to: &ParticipantId, message: ServerMessage) {
        let connections = self.connections.read().await;
        match connections.get(to) {
            Some(sender) => {
                if sender.send(message).is_err() {
                    tracing::debug!(
                        participant_id = %to,
                        "Outbound channel closed, dropping message"
                    );
                }
            }
            None => {
                tracing::debug!(
                    participant_id = %to,
                    "No connection for participant, dropping message"
                );
            }
        }
    }

    pub async fn handle_message(&self, from: &ParticipantId, message: ClientMessage) {
        tracing::debug!(participant_id = %from, event = message.name(), "Handling client message");

        let mut registry = self.registry.write().await;

        match message {
            ClientMessage::CreateRoom { lesson_id, room_id } => {
                match registry.create_room(from.clone(), lesson_id, room_id.as_deref()) {
                    Ok(outcome) => {
                        self.send(
                            from,
                            ServerMessage::RoomCreated {
                                room_id: outcome.code.clone(),
                            },
                        )
                        .await;

                        if let CreateDisposition::Reclaimed {
                            student: Some(student),
                        } = outcome.disposition
                        {
                            self.send(
                                &student,
                                ServerMessage::PeerJoined {
                                    peer_id: from.clone(),
                                    room_id: outcome.code.clone(),
                                },
                            )
                            .await;
                            self.send(
                                from,
                                ServerMessage::PeerJoined {
                                    peer_id: student,
                                    room_id: outcome.code,
                                },
                            )
                            .await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            participant_id = %from,
                            error = %e,
                            actionable = e.is_actionable(),
                            "Room creation failed"
                        );
                        self.send(from, ServerMessage::create_error(&e)).await;
                    }
                }
            }

            ClientMessage::JoinRoom { room_id } => {
                match registry.join_room(from.clone(), &room_id) {
                    Ok(joined) => {
                        self.send(
                            from,
                            ServerMessage::RoomJoined {
                                room_id: joined.code.clone(),
                                shared_state: joined.shared_state,
                            },
                        )
                        .await;

                        if joined.tutor_connected {
                            self.send(
                                &joined.tutor,
                                ServerMessage::PeerJoined {
                                    peer_id: from.clone(),
                                    room_id: joined.code,
                                },
                            )
                            .await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            participant_id = %from,
                            room_code = %room_id,
                            error = %e,
                            actionable = e.is_actionable(),
                            "Join failed"
                        );
                        self.send(from, ServerMessage::join_error(&e)).await;
                    }
                }
            }

            ClientMessage::WebrtcOffer { room_id, offer } => {
                match registry.route(&room_id, from, Route::TutorToStudent) {
                    Some(student) => {
                        self.send(
                            &student,
                            ServerMessage::WebrtcOffer {
                                offer,
                                peer_id: from.clone(),
                            },
                        )
                        .await;
                    }
                    None => log_orphaned(from, &room_id, "webrtc-offer"),
                }
            }

            ClientMessage::WebrtcAnswer { room_id, answer } => {
                match registry.route(&room_id, from, Route::StudentToTutor) {
                    Some(tutor) => {
                        self.send(
                            &tutor,
                            ServerMessage::WebrtcAnswer {
                                answer,
                                peer_id: from.clone(),
                            },
                        )
                        .await;
                    }
                    None => log_orphaned(from, &room_id, "webrtc-answer"),
                }
            }

            ClientMessage::IceCandidate { room_id, candidate } => {
                match registry.route(&room_id, from, Route::ToOther) {
                    Some(other) => {
                        self.send(
                            &other,
                            ServerMessage::IceCandidate {
                                candidate,
                                peer_id: from.clone(),
                            },
                        )
                        .await;
                    }
                    None => log_orphaned(from, &room_id, "ice-candidate"),
                }
            }

            ClientMessage::StateUpdate {
                room_id,
                state_event,
            } => {
                if let Err(e) =
                    registry.update_state(&room_id, from, state_event.shared_state_patch())
                {
                    tracing::debug!(
                        participant_id = %from,
                        room_code = %room_id,
                        error = %e,
                        "Dropping state update"
                    );
                    return;
                }

                if let Some(student) = registry.route(&room_id, from, Route::TutorToStudent) {
                    self.send(&student, ServerMessage::StateUpdate { state_event })
                        .await;
                }
            }

            ClientMessage::LeaveRoom { room_id } => match registry.leave_room(from, &room_id) {
                Ok(LeaveOutcome::Closed(closed)) => {
                    self.notify_closed(vec![closed]).await;
                }
                Ok(LeaveOutcome::StudentLeft { code, tutor }) => {
                    if let Some(tutor) = tutor {
                        self.send(
                            &tutor,
                            ServerMessage::PeerLeft {
                                room_id: code,
                                reason: "Student left".to_string(),
                            },
                        )
                        .await;
                    }
                }
                Err(e) => {
                    tracing::warn!(participant_id = %from, error = %e, "Leave failed");
                    self.send(
                        from,
                        ServerMessage::Error {
                            error: e.to_string(),
                        },
                    )
                    .await;
                }
            },
        }
    }

    /// Transport dropped: forget the connection and start the grace period.
    pub async fn handle_disconnect(&self, participant: &ParticipantId) {
        let mut registry = self.registry.write().await;
        self.connections.write().await.remove(participant);

        let Some(info) = registry.handle_disconnect(participant) else {
            return;
        };

        if let Some(other) = info.other {
            let reason = if info.was_tutor {
                "Tutor disconnected"
            } else {
                "Student disconnected"
            };
            self.send(
                &other,
                ServerMessage::PeerLeft {
                    room_id: info.room_code,
                    reason: reason.to_string(),
                },
            )
            .await;
        }
    }

    /// Run grace-period re-checks that have come due. Returns rooms deleted.
    pub async fn run_due_checks(&self) -> usize {
        let mut registry = self.registry.write().await;
        let closed = registry.run_due_checks();
        self.notify_closed(closed).await
    }

    /// Delete rooms past their TTL. Returns rooms deleted.
    pub async fn cleanup_expired(&self) -> usize {
        let mut registry = self.registry.write().await;
        let closed = registry.cleanup_expired();
        self.notify_closed(closed).await
    }

    async fn notify_closed(&self, closed: Vec<ClosedRoom>) -> usize {
        let count = closed.len();
        for room in closed {
            tracing::info!(room_code = %room.code, reason = %room.reason, "Room closed");
            for participant in &room.notify {
                self.send(
                    participant,
                    ServerMessage::RoomClosed {
                        room_id: room.code.clone(),
                        reason: room.reason.to_string(),
                    },
                )
                .await;
            }
        }
        count
    }

    /// Drive grace re-checks and the expiry sweep on their own intervals.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let server = self.clone();

        tokio::spawn(async move {
            let mut grace_tick = interval(server.rooms.grace_tick);
            grace_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sweep = interval(server.rooms.sweep_interval);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                grace_tick_ms = server.rooms.grace_tick.as_millis() as u64,
                sweep_interval_secs = server.rooms.sweep_interval.as_secs(),
                "Room maintenance started"
            );

            loop {
                tokio::select! {
                    _ = grace_tick.tick() => {
                        server.run_due_checks().await;
                    }
                    _ = sweep.tick() => {
                        server.cleanup_expired().await;
                    }
                }
            }
        })
    }
}

fn log_orphaned(from: &ParticipantId, room_id: &str, event: &str) {
    tracing::debug!(
        participant_id = %from,
        room_code = %room_id,
        event = event,
        "Dropping orphaned signaling message"
    );
}
