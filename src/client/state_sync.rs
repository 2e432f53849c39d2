use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::transport::SignalingTransport;
use crate::error::Result;
use crate::protocol::{ClientMessage, Role, RoomCode, ServerMessage, StateEvent, StateEventKind};

type Handler = Arc<dyn Fn(&StateEvent) + Send + Sync>;

/// Which events a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFilter {
    Kind(StateEventKind),
    All,
}

impl From<StateEventKind> for EventFilter {
    fn from(kind: StateEventKind) -> Self {
        EventFilter::Kind(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscribers {
    by_kind: HashMap<StateEventKind, Vec<(SubscriptionId, Handler)>>,
    all: Vec<(SubscriptionId, Handler)>,
}

/// Tutor-to-student lesson state channel.
///
/// Only the tutor transmits. Every participant dispatches received events to
/// subscribers for that event kind first, then to wildcard subscribers, each
/// group in registration order.
pub struct StateSync {
    role: Role,
    room: RoomCode,
    transport: Arc<dyn SignalingTransport>,
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
    listener: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl StateSync {
    pub fn new(role: Role, room: RoomCode, transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            role,
            room,
            transport,
            subscribers: Mutex::new(Subscribers::default()),
            next_id: AtomicU64::new(1),
            listener: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Transmit an event and apply it locally right away.
    ///
    /// A student calling this gets a warning and nothing is sent. Local
    /// subscribers run even when transmission fails; the transmit error is
    /// still returned.
    pub fn send(&self, event: StateEvent) -> Result<()> {
        if !self.role.is_tutor() {
            tracing::warn!(
                room_code = %self.room,
                event = ?event.kind(),
                "Only the tutor can send state events"
            );
            return Ok(());
        }
        if self.disposed.load(Ordering::Acquire) {
            return Ok(());
        }

        let sent = self.transport.send(ClientMessage::StateUpdate {
            room_id: self.room.to_string(),
            state_event: event.clone(),
        });
        if let Err(e) = &sent {
            tracing::warn!(room_code = %self.room, error = %e, "Failed to transmit state event");
        }

        self.deliver(&event);
        sent
    }

    pub fn subscribe(
        &self,
        filter: impl Into<EventFilter>,
        handler: impl Fn(&StateEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(handler);

        let mut subscribers = self.subscribers.lock();
        match filter.into() {
            EventFilter::Kind(kind) => {
                subscribers.by_kind.entry(kind).or_default().push((id, handler))
            }
            EventFilter::All => subscribers.all.push((id, handler)),
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();

        if let Some(index) = subscribers.all.iter().position(|(sub, _)| *sub == id) {
            subscribers.all.remove(index);
            return true;
        }

        for handlers in subscribers.by_kind.values_mut() {
            if let Some(index) = handlers.iter().position(|(sub, _)| *sub == id) {
                handlers.remove(index);
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self) -> usize {
        let subscribers = self.subscribers.lock();
        subscribers.all.len() + subscribers.by_kind.values().map(Vec::len).sum::<usize>()
    }

    /// Dispatch one received event to local subscribers.
    pub fn deliver(&self, event: &StateEvent) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }

        let handlers: Vec<Handler> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .by_kind
                .get(&event.kind())
                .into_iter()
                .flatten()
                .chain(subscribers.all.iter())
                .map(|(_, handler)| handler.clone())
                .collect()
        };

        for handler in handlers {
            handler(event);
        }
    }

    /// Start consuming `state-update` notifications from a signaling stream.
    /// Replaces any previous attachment.
    pub fn attach(self: &Arc<Self>, mut messages: broadcast::Receiver<ServerMessage>) {
        let sync: Weak<Self> = Arc::downgrade(self);
        let room = self.room.clone();

        let handle = tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(ServerMessage::StateUpdate { state_event }) => match sync.upgrade() {
                        Some(sync) => sync.deliver(&state_event),
                        None => break,
                    },
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(room_code = %room, skipped, "State listener lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Drop every subscription and detach from the signaling stream.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        *self.subscribers.lock() = Subscribers::default();
    }
}

impl Drop for StateSync {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}
