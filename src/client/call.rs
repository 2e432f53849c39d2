use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use super::media::AudioSource;
use super::negotiator::{
    ConnectionState, NegotiatorDeps, PeerConnectionFactory, PeerNegotiator, RemoteMedia,
};
use super::reconnect::ConnectionStatus;
use super::session::SignalingClient;
use super::state_sync::StateSync;
use super::transport::SignalingTransport;
use crate::error::{Result, SignalError};
use crate::protocol::{ClientMessage, Role, RoomCode, ServerMessage};

const CALL_EVENT_CAPACITY: usize = 64;

/// What the UI layer needs to know about a call.
#[derive(Debug, Clone)]
pub enum CallEvent {
    RoomReady {
        code: RoomCode,
        shared_state: Map<String, Value>,
    },
    PeerJoined,
    PeerLeft {
        reason: String,
    },
    RoomClosed {
        reason: String,
    },
    ConnectionState(ConnectionState),
    RemoteMedia(RemoteMedia),
    Signaling(ConnectionStatus),
    /// `code` is the server's error id when one was given.
    Error {
        message: String,
        code: Option<String>,
    },
}

/// Media collaborators used for every room this call enters.
#[derive(Clone)]
pub struct CallMedia {
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub audio: Arc<dyn AudioSource>,
}

struct ActiveRoom {
    code: RoomCode,
    negotiator: Arc<PeerNegotiator>,
    state_sync: Arc<StateSync>,
}

/// One participant's call: turns server notifications into negotiator and
/// state sync actions, and re-emits presence for the UI.
pub struct CallSession {
    role: Role,
    media: CallMedia,
    transport: Arc<dyn SignalingTransport>,
    feed: broadcast::Sender<ServerMessage>,
    active: Mutex<Option<ActiveRoom>>,
    events: broadcast::Sender<CallEvent>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl CallSession {
    /// Start processing notifications from `feed`. Outbound traffic goes
    /// through `transport`.
    pub fn start(
        role: Role,
        media: CallMedia,
        transport: Arc<dyn SignalingTransport>,
        feed: broadcast::Sender<ServerMessage>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(CALL_EVENT_CAPACITY);
        let session = Arc::new(Self {
            role,
            media,
            transport,
            feed: feed.clone(),
            active: Mutex::new(None),
            events,
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        let mut messages = feed.subscribe();
        let weak = Arc::downgrade(&session);
        let pump = tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(message) => match weak.upgrade() {
                        Some(session) => session.on_server_message(message).await,
                        None => break,
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Call lagged behind signaling notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        session.tasks.lock().push(pump);
        session
    }

    /// Drive a call over a live [`SignalingClient`], forwarding its status.
    pub fn over(client: &Arc<SignalingClient>, role: Role, media: CallMedia) -> Arc<Self> {
        let session = Self::start(role, media, client.clone(), client.feed());

        let mut status = client.watch_status();
        let events = session.events.clone();
        let forward = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = status.borrow_and_update().clone();
                let _ = events.send(CallEvent::Signaling(current));
            }
        });
        session.tasks.lock().push(forward);
        session
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Tutor: open a room, optionally under a pre-generated code.
    pub fn create_room(
        &self,
        requested: Option<&RoomCode>,
        lesson_id: Option<String>,
    ) -> Result<()> {
        if !self.role.is_tutor() {
            return Err(SignalError::role("only the tutor creates rooms"));
        }
        self.transport.send(ClientMessage::CreateRoom {
            lesson_id,
            room_id: requested.map(RoomCode::to_string),
        })
    }

    /// Student: join the room behind a code the tutor shared.
    pub fn join_room(&self, code: &str) -> Result<()> {
        if self.role.is_tutor() {
            return Err(SignalError::role("the tutor cannot join as a student"));
        }
        self.transport.send(ClientMessage::JoinRoom {
            room_id: code.to_string(),
        })
    }

    pub async fn room_code(&self) -> Option<RoomCode> {
        self.active.lock().await.as_ref().map(|room| room.code.clone())
    }

    pub async fn negotiator(&self) -> Option<Arc<PeerNegotiator>> {
        self.active.lock().await.as_ref().map(|room| room.negotiator.clone())
    }

    pub async fn state_sync(&self) -> Option<Arc<StateSync>> {
        self.active.lock().await.as_ref().map(|room| room.state_sync.clone())
    }

    /// Leave the room and release local media.
    pub async fn hang_up(&self) {
        let active = self.active.lock().await.take();
        if let Some(room) = active {
            let leave = ClientMessage::LeaveRoom {
                room_id: room.code.to_string(),
            };
            if let Err(e) = self.transport.send(leave) {
                tracing::debug!(room_code = %room.code, error = %e, "Leave not delivered");
            }
            Self::teardown(room).await;
        }
    }

    async fn on_server_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::RoomCreated { room_id } => self.enter_room(room_id, Map::new()).await,
            ServerMessage::RoomJoined {
                room_id,
                shared_state,
            } => self.enter_room(room_id, shared_state).await,
            ServerMessage::CreateError { error, code }
            | ServerMessage::JoinError { error, code } => {
                self.emit(CallEvent::Error {
                    message: error,
                    code: Some(code),
                });
            }
            ServerMessage::PeerJoined { peer_id, .. } => {
                tracing::info!(peer_id = %peer_id, "Peer joined the room");
                self.emit(CallEvent::PeerJoined);
                if self.role.is_tutor() {
                    if let Some(negotiator) = self.negotiator().await {
                        if let Err(e) = negotiator.create_offer().await {
                            self.report(e);
                        }
                    }
                }
            }
            ServerMessage::PeerLeft { reason, .. } => {
                tracing::info!(reason = %reason, "Peer left");
                if let Some(negotiator) = self.negotiator().await {
                    negotiator.notify_state(ConnectionState::Disconnected);
                }
                self.emit(CallEvent::PeerLeft { reason });
            }
            ServerMessage::RoomClosed { reason, .. } => {
                let active = self.active.lock().await.take();
                if let Some(room) = active {
                    Self::teardown(room).await;
                }
                self.emit(CallEvent::RoomClosed { reason });
            }
            ServerMessage::WebrtcOffer { .. }
            | ServerMessage::WebrtcAnswer { .. }
            | ServerMessage::IceCandidate { .. } => match self.negotiator().await {
                Some(negotiator) => {
                    if let Err(e) = negotiator.handle_signal(&message).await {
                        self.report(e);
                    }
                }
                None => tracing::debug!("Negotiation message before entering a room"),
            },
            // Delivered by the attached state sync
            ServerMessage::StateUpdate { .. } => {}
            ServerMessage::Error { error } => {
                self.emit(CallEvent::Error {
                    message: error,
                    code: None,
                });
            }
        }
    }

    async fn enter_room(&self, code: RoomCode, shared_state: Map<String, Value>) {
        let mut active = self.active.lock().await;

        let same_room = active.as_ref().map(|room| room.code == code).unwrap_or(false);
        if !same_room {
            if let Some(previous) = active.take() {
                Self::teardown(previous).await;
            }

            let negotiator = Arc::new(PeerNegotiator::new(
                self.role,
                code.clone(),
                NegotiatorDeps {
                    factory: self.media.factory.clone(),
                    audio: self.media.audio.clone(),
                    transport: self.transport.clone(),
                },
            ));
            let events = self.events.clone();
            negotiator.on_connection_state_change(move |state| {
                let _ = events.send(CallEvent::ConnectionState(state));
            });
            let events = self.events.clone();
            negotiator.on_remote_media(move |media| {
                let _ = events.send(CallEvent::RemoteMedia(media));
            });

            let state_sync = Arc::new(StateSync::new(
                self.role,
                code.clone(),
                self.transport.clone(),
            ));
            state_sync.attach(self.feed.subscribe());

            *active = Some(ActiveRoom {
                code: code.clone(),
                negotiator,
                state_sync,
            });
            tracing::info!(room_code = %code, role = %self.role, "Entered room");
        }

        if let Some(room) = active.as_ref() {
            if let Err(e) = room.negotiator.initialize_local_audio().await {
                self.emit(CallEvent::ConnectionState(ConnectionState::Failed));
                self.report(e);
            }
        }
        drop(active);

        self.emit(CallEvent::RoomReady { code, shared_state });
    }

    async fn teardown(room: ActiveRoom) {
        room.state_sync.dispose();
        room.negotiator.disconnect().await;
    }

    fn report(&self, error: SignalError) {
        tracing::warn!(error = %error, "Call error");
        self.emit(CallEvent::Error {
            message: error.to_string(),
            code: Some(error.code().to_string()),
        });
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
