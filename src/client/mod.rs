//! Participant side: signaling session, media negotiation and lesson state.

pub mod call;
pub mod media;
pub mod negotiator;
pub mod observer;
pub mod reconnect;
pub mod session;
pub mod state_sync;
pub mod transport;
pub mod webrtc_utils;

pub use call::{CallEvent, CallMedia, CallSession};
pub use media::{AudioConstraints, AudioSource, LocalAudio, SampleTrackSource};
pub use negotiator::{
    map_connection_state, ConnectionState, NegotiatorDeps, PeerConnection, PeerConnectionFactory,
    PeerEvent, PeerNegotiator, RemoteMedia, WebRtcFactory,
};
pub use observer::{ObserverSlot, ObserverToken};
pub use reconnect::{reconnect_delay, should_reconnect, ConnectionStatus, ReconnectPolicy};
pub use session::{RoomIntent, SignalingClient};
pub use state_sync::{EventFilter, StateSync, SubscriptionId};
pub use transport::{ChannelTransport, SignalingTransport};
