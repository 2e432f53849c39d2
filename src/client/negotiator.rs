use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::media::{AudioConstraints, AudioSource, LocalAudio};
use super::observer::{ObserverSlot, ObserverToken};
use super::transport::SignalingTransport;
use super::webrtc_utils::{create_webrtc_api, get_ice_servers};
use crate::config::IceConfig;
use crate::error::{Result, SignalError};
use crate::protocol::{ClientMessage, Role, RoomCode, ServerMessage};

/// Connection state as presented to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Pure mapping from the native peer connection state.
pub fn map_connection_state(native: RTCPeerConnectionState) -> ConnectionState {
    match native {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
            ConnectionState::Connecting
        }
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
            ConnectionState::Disconnected
        }
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Unspecified => ConnectionState::Disconnected,
    }
}

/// The counterpart's audio as it arrives.
#[derive(Clone)]
pub struct RemoteMedia {
    pub track_id: String,
    pub stream_id: String,
    pub kind: String,
    pub track: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Asynchronous notifications raised by an underlying connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(Value),
    StateChanged(ConnectionState),
    RemoteTrack(RemoteMedia),
}

/// One native media connection. Descriptions and candidates travel as the
/// JSON shapes browsers use (`{type, sdp}`, `{candidate, sdpMid, ...}`).
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_audio(&self, audio: &LocalAudio) -> Result<()>;

    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<Value>;

    /// Creates an answer and applies it as the local description.
    async fn create_answer(&self) -> Result<Value>;

    async fn set_remote_description(&self, description: Value) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: Value) -> Result<()>;

    fn connection_state(&self) -> ConnectionState;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, events: mpsc::UnboundedSender<PeerEvent>)
        -> Result<Arc<dyn PeerConnection>>;
}

pub struct WebRtcFactory {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcFactory {
    pub fn new(ice: &IceConfig) -> Result<Self> {
        Ok(Self {
            api: create_webrtc_api()?,
            ice_servers: get_ice_servers(ice),
        })
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json().map(serde_json::to_value) {
                    Ok(Ok(json)) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(json));
                    }
                    Ok(Err(e)) => tracing::warn!(error = %e, "Failed to encode ICE candidate"),
                    Err(e) => tracing::warn!(error = %e, "Failed to read ICE candidate"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!(state = %state, "Peer connection state changed");
            let _ = tx.send(PeerEvent::StateChanged(map_connection_state(state)));
            Box::pin(async {})
        }));

        let tx = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let media = RemoteMedia {
                track_id: track.id(),
                stream_id: track.stream_id(),
                kind: track.kind().to_string(),
                track: Some(track),
            };
            let _ = tx.send(PeerEvent::RemoteTrack(media));
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcPeer { pc }))
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcPeer {
    fn parse_description(description: Value) -> Result<RTCSessionDescription> {
        let description: RTCSessionDescription = serde_json::from_value(description)?;
        let parsed = match description.sdp_type {
            RTCSdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
            RTCSdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
            RTCSdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
            other => {
                return Err(SignalError::NegotiationOutOfOrder(format!(
                    "unsupported session description type {}",
                    other
                )))
            }
        };
        Ok(parsed)
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_local_audio(&self, audio: &LocalAudio) -> Result<()> {
        let sender = self
            .pc
            .add_track(audio.track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Drain RTCP so interceptors keep running
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<Value> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(serde_json::to_value(offer)?)
    }

    async fn create_answer(&self) -> Result<Value> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(serde_json::to_value(answer)?)
    }

    async fn set_remote_description(&self, description: Value) -> Result<()> {
        let description = Self::parse_description(description)?;
        self.pc.set_remote_description(description).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<()> {
        let candidate: RTCIceCandidateInit = serde_json::from_value(candidate)?;
        self.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Collaborators a negotiator is built from.
#[derive(Clone)]
pub struct NegotiatorDeps {
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub audio: Arc<dyn AudioSource>,
    pub transport: Arc<dyn SignalingTransport>,
}

#[derive(Default)]
struct NegotiationState {
    local_audio: Option<LocalAudio>,
    connection: Option<Arc<dyn PeerConnection>>,
    event_pump: Option<JoinHandle<()>>,
    pending_offer: Option<Value>,
}

/// Drives one participant's side of the offer/answer exchange for a room.
///
/// Negotiation steps are serialized behind one async lock, so inbound
/// signals are applied in the order they are handed in.
pub struct PeerNegotiator {
    role: Role,
    room: RoomCode,
    deps: NegotiatorDeps,
    state: Mutex<NegotiationState>,
    remote_media: Arc<ObserverSlot<RemoteMedia>>,
    state_observer: Arc<ObserverSlot<ConnectionState>>,
    closed: Arc<AtomicBool>,
}

impl PeerNegotiator {
    pub fn new(role: Role, room: RoomCode, deps: NegotiatorDeps) -> Self {
        Self {
            role,
            room,
            deps,
            state: Mutex::new(NegotiationState::default()),
            remote_media: Arc::new(ObserverSlot::new()),
            state_observer: Arc::new(ObserverSlot::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn room(&self) -> &RoomCode {
        &self.room
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Acquire the microphone and replay an offer that arrived before it.
    pub async fn initialize_local_audio(&self) -> Result<LocalAudio> {
        let mut state = self.state.lock().await;
        if self.is_closed() {
            return Err(SignalError::NegotiationOutOfOrder(
                "negotiator has been disconnected".to_string(),
            ));
        }

        if let Some(audio) = &state.local_audio {
            return Ok(audio.clone());
        }

        let audio = self.deps.audio.acquire(AudioConstraints::voice()).await?;
        state.local_audio = Some(audio.clone());
        tracing::info!(room_code = %self.room, role = %self.role, "Local audio ready");

        if let Some(offer) = state.pending_offer.take() {
            tracing::debug!(room_code = %self.room, "Replaying offer queued before local audio");
            self.accept_offer(&mut state, offer).await?;
        }

        Ok(audio)
    }

    /// Tutor only: open a connection with local audio attached and send the offer.
    pub async fn create_offer(&self) -> Result<()> {
        if !self.role.is_tutor() {
            return Err(SignalError::role("only the tutor creates offers"));
        }

        let mut state = self.state.lock().await;
        if self.is_closed() {
            return Ok(());
        }

        let audio = state.local_audio.clone().ok_or_else(|| {
            SignalError::NegotiationOutOfOrder("local audio is not initialized".to_string())
        })?;

        let connection = self.open_connection(&mut state).await?;
        connection.add_local_audio(&audio).await?;
        let offer = connection.create_offer().await?;

        self.deps.transport.send(ClientMessage::WebrtcOffer {
            room_id: self.room.to_string(),
            offer,
        })?;
        tracing::info!(room_code = %self.room, "Offer sent");
        Ok(())
    }

    /// Student side of an inbound offer. Queued until local audio exists.
    pub async fn handle_offer(&self, offer: Value) -> Result<()> {
        if self.role.is_tutor() {
            return Err(SignalError::role("tutor received an offer"));
        }

        let mut state = self.state.lock().await;
        if self.is_closed() {
            return Ok(());
        }

        if state.local_audio.is_none() {
            tracing::debug!(room_code = %self.room, "Offer arrived before local audio, queued");
            state.pending_offer = Some(offer);
            return Ok(());
        }

        self.accept_offer(&mut state, offer).await
    }

    async fn accept_offer(&self, state: &mut NegotiationState, offer: Value) -> Result<()> {
        let audio = state.local_audio.clone().ok_or_else(|| {
            SignalError::NegotiationOutOfOrder("local audio is not initialized".to_string())
        })?;

        let connection = self.open_connection(state).await?;
        connection.add_local_audio(&audio).await?;
        connection.set_remote_description(offer).await?;
        let answer = connection.create_answer().await?;

        self.deps.transport.send(ClientMessage::WebrtcAnswer {
            room_id: self.room.to_string(),
            answer,
        })?;
        tracing::info!(room_code = %self.room, "Answer sent");
        Ok(())
    }

    /// Tutor side of an inbound answer.
    pub async fn handle_answer(&self, answer: Value) -> Result<()> {
        if !self.role.is_tutor() {
            return Err(SignalError::role("student received an answer"));
        }

        let state = self.state.lock().await;
        if self.is_closed() {
            return Ok(());
        }

        let connection = state.connection.clone().ok_or_else(|| {
            SignalError::NegotiationOutOfOrder("answer without a pending offer".to_string())
        })?;
        connection.set_remote_description(answer).await
    }

    /// Apply a trickled candidate. Dropped when no connection exists yet.
    pub async fn handle_candidate(&self, candidate: Value) -> Result<()> {
        let state = self.state.lock().await;
        if self.is_closed() {
            return Ok(());
        }

        match state.connection.clone() {
            Some(connection) => connection.add_ice_candidate(candidate).await,
            None => {
                tracing::debug!(
                    room_code = %self.room,
                    "Dropping ICE candidate without a connection"
                );
                Ok(())
            }
        }
    }

    /// Route a negotiation notification. Returns false for anything else.
    pub async fn handle_signal(&self, message: &ServerMessage) -> Result<bool> {
        match message {
            ServerMessage::WebrtcOffer { offer, .. } => self.handle_offer(offer.clone()).await?,
            ServerMessage::WebrtcAnswer { answer, .. } => {
                self.handle_answer(answer.clone()).await?
            }
            ServerMessage::IceCandidate { candidate, .. } => {
                self.handle_candidate(candidate.clone()).await?
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub fn on_remote_media(
        &self,
        callback: impl Fn(RemoteMedia) + Send + Sync + 'static,
    ) -> ObserverToken {
        self.remote_media.set(callback)
    }

    pub fn on_connection_state_change(
        &self,
        callback: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> ObserverToken {
        self.state_observer.set(callback)
    }

    pub fn remove_remote_media_observer(&self, token: ObserverToken) -> bool {
        self.remote_media.remove(token)
    }

    pub fn remove_connection_state_observer(&self, token: ObserverToken) -> bool {
        self.state_observer.remove(token)
    }

    /// Current state, read from the live connection.
    pub async fn connection_state(&self) -> ConnectionState {
        match &self.state.lock().await.connection {
            Some(connection) => connection.connection_state(),
            None => ConnectionState::Disconnected,
        }
    }

    /// Force the UI-facing state, e.g. when the peer left the room.
    pub fn notify_state(&self, state: ConnectionState) {
        if !self.is_closed() {
            self.state_observer.notify(state);
        }
    }

    /// Stop local audio, close the connection and drop observers. Idempotent.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut state = self.state.lock().await;
        if let Some(audio) = state.local_audio.take() {
            audio.stop();
        }
        state.pending_offer = None;
        Self::close_connection(&mut state).await;

        self.remote_media.clear();
        self.state_observer.clear();
        tracing::info!(room_code = %self.room, "Negotiator disconnected");
    }

    async fn open_connection(
        &self,
        state: &mut NegotiationState,
    ) -> Result<Arc<dyn PeerConnection>> {
        Self::close_connection(state).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = self.deps.factory.create(tx).await?;

        let transport = self.deps.transport.clone();
        let remote_media = self.remote_media.clone();
        let state_observer = self.state_observer.clone();
        let closed = self.closed.clone();
        let room = self.room.clone();

        state.event_pump = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if closed.load(Ordering::Acquire) {
                    break;
                }
                match event {
                    PeerEvent::LocalCandidate(candidate) => {
                        let message = ClientMessage::IceCandidate {
                            room_id: room.to_string(),
                            candidate,
                        };
                        if let Err(e) = transport.send(message) {
                            tracing::warn!(
                                room_code = %room,
                                error = %e,
                                "Failed to send ICE candidate"
                            );
                        }
                    }
                    PeerEvent::StateChanged(connection_state) => {
                        state_observer.notify(connection_state);
                    }
                    PeerEvent::RemoteTrack(media) => {
                        tracing::info!(
                            room_code = %room,
                            track_id = %media.track_id,
                            "Remote media received"
                        );
                        remote_media.notify(media);
                    }
                }
            }
        }));

        state.connection = Some(connection.clone());
        Ok(connection)
    }

    async fn close_connection(state: &mut NegotiationState) {
        if let Some(pump) = state.event_pump.take() {
            pump.abort();
        }
        if let Some(connection) = state.connection.take() {
            if let Err(e) = connection.close().await {
                tracing::warn!(error = %e, "Failed to close peer connection");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{rig, Call};
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn code() -> RoomCode {
        RoomCode::parse("AB3D7K").unwrap()
    }

    #[test]
    fn test_state_mapping() {
        use RTCPeerConnectionState as Native;
        assert_eq!(map_connection_state(Native::New), ConnectionState::Connecting);
        assert_eq!(map_connection_state(Native::Connecting), ConnectionState::Connecting);
        assert_eq!(map_connection_state(Native::Connected), ConnectionState::Connected);
        assert_eq!(map_connection_state(Native::Disconnected), ConnectionState::Disconnected);
        assert_eq!(map_connection_state(Native::Closed), ConnectionState::Disconnected);
        assert_eq!(map_connection_state(Native::Failed), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_tutor_offer_carries_local_audio() {
        let mut rig = rig();
        let negotiator = PeerNegotiator::new(Role::Tutor, code(), rig.deps.clone());

        negotiator.initialize_local_audio().await.unwrap();
        negotiator.create_offer().await.unwrap();

        let peer = rig.factory.last().unwrap();
        assert_eq!(peer.calls(), vec![Call::AddAudio, Call::CreateOffer]);
        assert_eq!(
            rig.outbound.try_recv().unwrap(),
            ClientMessage::WebrtcOffer {
                room_id: "AB3D7K".into(),
                offer: json!({"type": "offer", "sdp": "fake-offer"})
            }
        );
    }

    #[tokio::test]
    async fn test_student_cannot_create_offer() {
        let rig = rig();
        let negotiator = PeerNegotiator::new(Role::Student, code(), rig.deps.clone());
        negotiator.initialize_local_audio().await.unwrap();

        let err = negotiator.create_offer().await.unwrap_err();
        assert!(matches!(err, SignalError::RoleViolation(_)));
        assert_eq!(rig.factory.count(), 0);
    }

    #[tokio::test]
    async fn test_offer_before_audio_is_replayed() {
        let mut rig = rig();
        let negotiator = PeerNegotiator::new(Role::Student, code(), rig.deps.clone());
        let offer = json!({"type": "offer", "sdp": "remote"});

        negotiator.handle_offer(offer.clone()).await.unwrap();
        assert_eq!(rig.factory.count(), 0);
        assert!(rig.outbound.try_recv().is_err());

        negotiator.initialize_local_audio().await.unwrap();

        let peer = rig.factory.last().unwrap();
        assert_eq!(
            peer.calls(),
            vec![Call::AddAudio, Call::SetRemote(offer), Call::CreateAnswer]
        );
        assert!(matches!(
            rig.outbound.try_recv().unwrap(),
            ClientMessage::WebrtcAnswer { .. }
        ));
    }

    #[tokio::test]
    async fn test_media_denial_surfaces_and_keeps_offer_queued() {
        let rig = rig();
        rig.audio.set_permission(false);
        let negotiator = PeerNegotiator::new(Role::Student, code(), rig.deps.clone());

        negotiator.handle_offer(json!({"type": "offer", "sdp": "x"})).await.unwrap();
        let err = negotiator.initialize_local_audio().await.unwrap_err();
        assert!(matches!(err, SignalError::MediaAccessDenied(_)));
        assert_eq!(rig.factory.count(), 0);

        rig.audio.set_permission(true);
        negotiator.initialize_local_audio().await.unwrap();
        assert_eq!(rig.factory.count(), 1);
    }

    #[tokio::test]
    async fn test_answer_without_connection_is_out_of_order() {
        let rig = rig();
        let negotiator = PeerNegotiator::new(Role::Tutor, code(), rig.deps.clone());
        let err = negotiator
            .handle_answer(json!({"type": "answer", "sdp": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::NegotiationOutOfOrder(_)));
    }

    #[tokio::test]
    async fn test_candidates_apply_in_arrival_order() {
        let rig = rig();
        let negotiator = PeerNegotiator::new(Role::Tutor, code(), rig.deps.clone());

        // no connection yet: dropped
        negotiator.handle_candidate(json!({"candidate": "early"})).await.unwrap();

        negotiator.initialize_local_audio().await.unwrap();
        negotiator.create_offer().await.unwrap();
        negotiator.handle_candidate(json!({"candidate": "a"})).await.unwrap();
        negotiator.handle_candidate(json!({"candidate": "b"})).await.unwrap();
        negotiator
            .handle_answer(json!({"type": "answer", "sdp": "x"}))
            .await
            .unwrap();

        let peer = rig.factory.last().unwrap();
        assert_eq!(
            peer.calls()[2..].to_vec(),
            vec![
                Call::AddCandidate(json!({"candidate": "a"})),
                Call::AddCandidate(json!({"candidate": "b"})),
                Call::SetRemote(json!({"type": "answer", "sdp": "x"})),
            ]
        );
    }

    #[tokio::test]
    async fn test_local_candidates_and_state_reach_observers() {
        let mut rig = rig();
        let negotiator = PeerNegotiator::new(Role::Tutor, code(), rig.deps.clone());
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        negotiator.on_connection_state_change(move |state| {
            let _ = state_tx.send(state);
        });

        negotiator.initialize_local_audio().await.unwrap();
        negotiator.create_offer().await.unwrap();
        rig.outbound.try_recv().unwrap();

        let peer = rig.factory.last().unwrap();
        peer.emit(PeerEvent::LocalCandidate(json!({"candidate": "local"})));
        peer.emit(PeerEvent::StateChanged(ConnectionState::Connected));

        let state = tokio::time::timeout(Duration::from_secs(1), state_rx.recv())
            .await
            .unwrap();
        assert_eq!(state, Some(ConnectionState::Connected));
        assert_eq!(
            rig.outbound.try_recv().unwrap(),
            ClientMessage::IceCandidate {
                room_id: "AB3D7K".into(),
                candidate: json!({"candidate": "local"})
            }
        );
    }

    #[tokio::test]
    async fn test_connection_state_is_read_from_connection() {
        let rig = rig();
        let negotiator = PeerNegotiator::new(Role::Tutor, code(), rig.deps.clone());
        assert_eq!(negotiator.connection_state().await, ConnectionState::Disconnected);

        negotiator.initialize_local_audio().await.unwrap();
        negotiator.create_offer().await.unwrap();
        assert_eq!(negotiator.connection_state().await, ConnectionState::Connecting);

        *rig.factory.last().unwrap().state.lock() = Some(ConnectionState::Failed);
        assert_eq!(negotiator.connection_state().await, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_ignores_late_signals() {
        let mut rig = rig();
        let negotiator = PeerNegotiator::new(Role::Tutor, code(), rig.deps.clone());
        negotiator.on_remote_media(|_| {});
        let audio = negotiator.initialize_local_audio().await.unwrap();
        negotiator.create_offer().await.unwrap();
        rig.outbound.try_recv().unwrap();

        negotiator.disconnect().await;
        negotiator.disconnect().await;

        let peer = rig.factory.last().unwrap();
        assert_eq!(peer.calls().iter().filter(|c| **c == Call::Close).count(), 1);
        assert!(!audio.is_live());

        negotiator
            .handle_answer(json!({"type": "answer", "sdp": "late"}))
            .await
            .unwrap();
        negotiator.handle_candidate(json!({"candidate": "late"})).await.unwrap();
        assert_eq!(peer.calls().last(), Some(&Call::Close));
        assert!(rig.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reoffer_replaces_connection() {
        let rig = rig();
        let negotiator = PeerNegotiator::new(Role::Tutor, code(), rig.deps.clone());
        negotiator.initialize_local_audio().await.unwrap();

        negotiator.create_offer().await.unwrap();
        let first = rig.factory.last().unwrap();
        negotiator.create_offer().await.unwrap();

        assert_eq!(rig.factory.count(), 2);
        assert_eq!(first.calls().last(), Some(&Call::Close));
    }

    #[tokio::test]
    async fn test_handle_signal_routes_negotiation_only() {
        let rig = rig();
        let negotiator = PeerNegotiator::new(Role::Student, code(), rig.deps.clone());

        let handled = negotiator
            .handle_signal(&ServerMessage::WebrtcOffer {
                offer: json!({"type": "offer", "sdp": "x"}),
                peer_id: "tutor".into(),
            })
            .await
            .unwrap();
        assert!(handled);

        let handled = negotiator
            .handle_signal(&ServerMessage::Error {
                error: "nope".into(),
            })
            .await
            .unwrap();
        assert!(!handled);
    }
}
