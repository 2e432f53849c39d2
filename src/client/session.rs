//! Persistent signaling connection.
//!
//! Keeps one WebSocket to the server open, retries with capped exponential
//! backoff when it drops, and restores the room afterwards: a tutor re-issues
//! `create-room` with its code (reclaim), a student re-issues `join-room`.

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::reconnect::{should_reconnect, ConnectionStatus, ReconnectPolicy};
use super::transport::SignalingTransport;
use crate::error::{Result, SignalError};
use crate::protocol::{ClientMessage, RoomCode, ServerMessage};

const EVENT_CAPACITY: usize = 256;

/// The room request to repeat after a reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomIntent {
    Create {
        requested: Option<String>,
        lesson_id: Option<String>,
    },
    Join {
        code: String,
    },
}

impl RoomIntent {
    fn to_message(&self) -> ClientMessage {
        match self {
            RoomIntent::Create {
                requested,
                lesson_id,
            } => ClientMessage::CreateRoom {
                lesson_id: lesson_id.clone(),
                room_id: requested.clone(),
            },
            RoomIntent::Join { code } => ClientMessage::JoinRoom {
                room_id: code.clone(),
            },
        }
    }
}

/// How a connection ended.
#[derive(Debug, Clone, Default)]
struct CloseInfo {
    code: Option<u16>,
    reason: String,
}

pub struct SignalingClient {
    url: String,
    policy: ReconnectPolicy,
    outbound: RwLock<Option<mpsc::UnboundedSender<ClientMessage>>>,
    intent: RwLock<Option<RoomIntent>>,
    room: RwLock<Option<RoomCode>>,
    events: broadcast::Sender<ServerMessage>,
    status: watch::Sender<ConnectionStatus>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status, _) = watch::channel(ConnectionStatus::Closed);
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            url: url.into(),
            policy,
            outbound: RwLock::new(None),
            intent: RwLock::new(None),
            room: RwLock::new(None),
            events,
            status,
            shutdown,
            supervisor: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Every notification received from the server, in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.events.subscribe()
    }

    /// Sender side of the notification stream, for components that attach later.
    pub fn feed(&self) -> broadcast::Sender<ServerMessage> {
        self.events.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.read().is_some()
    }

    /// Code of the room this client created or joined, once confirmed.
    pub fn room_code(&self) -> Option<RoomCode> {
        self.room.read().clone()
    }

    pub fn intent(&self) -> Option<RoomIntent> {
        self.intent.read().clone()
    }

    /// Open the connection. The first attempt is not retried; later drops are.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let _ = self.shutdown.send_replace(false);
        self.status.send_replace(ConnectionStatus::Connecting);

        let reader = match self.open().await {
            Ok(reader) => reader,
            Err(e) => {
                self.status.send_replace(ConnectionStatus::Failed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        self.status.send_replace(ConnectionStatus::Connected);

        let client = self.clone();
        let supervisor = tokio::spawn(async move { client.supervise(reader).await });
        if let Some(previous) = self.supervisor.lock().replace(supervisor) {
            previous.abort();
        }
        Ok(())
    }

    pub fn create_room(&self, requested: Option<&str>, lesson_id: Option<String>) -> Result<()> {
        self.send(ClientMessage::CreateRoom {
            lesson_id,
            room_id: requested.map(str::to_string),
        })
    }

    pub fn join_room(&self, code: &str) -> Result<()> {
        self.send(ClientMessage::JoinRoom {
            room_id: code.to_string(),
        })
    }

    pub fn leave_room(&self) -> Result<()> {
        let room = self.room.read().clone();
        match room {
            Some(code) => self.send(ClientMessage::LeaveRoom {
                room_id: code.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Close the connection for good. No reconnect follows.
    pub fn close(&self) {
        let _ = self.shutdown.send_replace(true);
        *self.outbound.write() = None;
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }
        self.status.send_replace(ConnectionStatus::Closed);
        tracing::info!(url = %self.url, "Signaling connection closed");
    }

    async fn open(self: &Arc<Self>) -> Result<JoinHandle<CloseInfo>> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SignalError::transport(format!("connect to {}: {}", self.url, e)))?;
        tracing::info!(url = %self.url, "Connected to signaling server");

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize signaling message");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    tracing::error!(error = %e, "Failed to send signaling message");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let client = self.clone();
        let reader = tokio::spawn(async move {
            let mut close = CloseInfo::default();

            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(message) => client.dispatch(message),
                        Err(e) => {
                            tracing::warn!(error = %e, "Ignoring unparseable server message")
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            close.code = Some(u16::from(frame.code));
                            close.reason = frame.reason.to_string();
                        }
                        tracing::info!(
                            code = ?close.code,
                            reason = %close.reason,
                            "Signaling server closed the connection"
                        );
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Signaling connection error");
                        break;
                    }
                }
            }
            close
        });

        *self.outbound.write() = Some(tx);
        Ok(reader)
    }

    fn dispatch(&self, message: ServerMessage) {
        match &message {
            ServerMessage::RoomCreated { room_id } => {
                *self.room.write() = Some(room_id.clone());
                // Reclaim the same code after a reconnect
                if let Some(RoomIntent::Create { requested, .. }) = self.intent.write().as_mut() {
                    *requested = Some(room_id.to_string());
                }
            }
            ServerMessage::RoomJoined { room_id, .. } => {
                *self.room.write() = Some(room_id.clone());
            }
            ServerMessage::RoomClosed { .. } => {
                *self.room.write() = None;
                *self.intent.write() = None;
            }
            _ => {}
        }

        // No receivers is fine
        let _ = self.events.send(message);
    }

    async fn supervise(self: Arc<Self>, mut reader: JoinHandle<CloseInfo>) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let close = tokio::select! {
                close = &mut reader => close.unwrap_or_default(),
                _ = shutdown.changed() => return,
            };
            *self.outbound.write() = None;

            if *shutdown.borrow() {
                return;
            }

            if !should_reconnect(close.code, &close.reason) {
                tracing::info!(code = ?close.code, "Signaling connection ended, not reconnecting");
                self.status.send_replace(ConnectionStatus::Closed);
                return;
            }

            match self.reconnect(&mut shutdown).await {
                Some(next) => reader = next,
                None => return,
            }
        }
    }

    async fn reconnect(
        self: &Arc<Self>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<JoinHandle<CloseInfo>> {
        let mut attempt = 0;

        loop {
            if self.policy.exhausted(attempt) {
                tracing::error!(attempts = attempt, "Could not reconnect to signaling server");
                self.status.send_replace(ConnectionStatus::Failed {
                    reason: "Could not reconnect. Please start a new session.".to_string(),
                });
                return None;
            }

            let delay = self.policy.delay(attempt);
            attempt += 1;
            self.status.send_replace(ConnectionStatus::Reconnecting {
                attempt,
                max_attempts: self.policy.max_attempts,
                next_retry_in: delay,
            });
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to signaling server"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return None,
            }

            match self.open().await {
                Ok(reader) => {
                    self.status.send_replace(ConnectionStatus::Connected);
                    self.restore_room();
                    return Some(reader);
                }
                Err(e) => tracing::warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }
    }

    fn restore_room(&self) {
        let intent = self.intent.read().clone();
        if let Some(intent) = intent {
            tracing::info!(?intent, "Restoring room after reconnect");
            if let Err(e) = self.send(intent.to_message()) {
                tracing::warn!(error = %e, "Failed to restore room");
            }
        }
    }
}

impl SignalingTransport for SignalingClient {
    fn send(&self, message: ClientMessage) -> Result<()> {
        match &message {
            ClientMessage::CreateRoom { lesson_id, room_id } => {
                *self.intent.write() = Some(RoomIntent::Create {
                    requested: room_id.clone(),
                    lesson_id: lesson_id.clone(),
                });
            }
            ClientMessage::JoinRoom { room_id } => {
                *self.intent.write() = Some(RoomIntent::Join {
                    code: room_id.clone(),
                });
            }
            ClientMessage::LeaveRoom { .. } => {
                *self.intent.write() = None;
                *self.room.write() = None;
            }
            _ => {}
        }

        let outbound = self.outbound.read();
        let tx = outbound
            .as_ref()
            .ok_or_else(|| SignalError::transport("not connected to signaling server"))?;
        tx.send(message)
            .map_err(|_| SignalError::transport("signaling connection closed"))
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Error as WsError;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            max_attempts,
        }
    }

    async fn next_client_message<S>(ws: &mut S) -> ClientMessage
    where
        S: futures::Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    async fn wait_for(
        status: &mut watch::Receiver<ConnectionStatus>,
        predicate: impl Fn(&ConnectionStatus) -> bool,
    ) -> ConnectionStatus {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = status.borrow_and_update().clone();
                if predicate(&current) {
                    return current;
                }
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let client = SignalingClient::new("ws://127.0.0.1:9/signal", fast_policy(1));
        let err = client.join_room("AB3D7K").unwrap_err();
        assert!(matches!(err, SignalError::SignalingTransport(_)));
        assert_eq!(
            client.intent(),
            Some(RoomIntent::Join {
                code: "AB3D7K".into()
            })
        );
    }

    #[tokio::test]
    async fn test_tutor_reclaims_room_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First connection: confirm the room, then drop without a close frame
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let first = next_client_message(&mut ws).await;
            let reply = ServerMessage::RoomCreated {
                room_id: RoomCode::parse("AB3D7K").unwrap(),
            };
            ws.send(Message::Text(serde_json::to_string(&reply).unwrap()))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let second = next_client_message(&mut ws).await;
            (first, second)
        });

        let client = SignalingClient::new(format!("ws://{}", addr), fast_policy(5));
        let mut status = client.watch_status();
        let mut events = client.subscribe();
        client.connect().await.unwrap();
        client.create_room(None, Some("a1-greetings".into())).unwrap();

        let created = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(created, ServerMessage::RoomCreated { .. }));

        let (first, second) = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        wait_for(&mut status, ConnectionStatus::is_connected).await;
        assert_eq!(
            first,
            ClientMessage::CreateRoom {
                lesson_id: Some("a1-greetings".into()),
                room_id: None
            }
        );
        assert_eq!(
            second,
            ClientMessage::CreateRoom {
                lesson_id: Some("a1-greetings".into()),
                room_id: Some("AB3D7K".into())
            }
        );
        assert_eq!(client.room_code().map(|c| c.to_string()), Some("AB3D7K".into()));
        client.close();
    }

    #[tokio::test]
    async fn test_student_rejoins_room_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let first = next_client_message(&mut ws).await;
            let reply = ServerMessage::RoomJoined {
                room_id: RoomCode::parse("AB3D7K").unwrap(),
                shared_state: serde_json::Map::new(),
            };
            ws.send(Message::Text(serde_json::to_string(&reply).unwrap()))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let second = next_client_message(&mut ws).await;
            (first, second)
        });

        let client = SignalingClient::new(format!("ws://{}", addr), fast_policy(5));
        let mut status = client.watch_status();
        let mut events = client.subscribe();
        client.connect().await.unwrap();
        client.join_room("ab3d7k").unwrap();

        let joined = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(joined, ServerMessage::RoomJoined { .. }));

        let (first, second) = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        wait_for(&mut status, ConnectionStatus::is_connected).await;
        assert_eq!(
            first,
            ClientMessage::JoinRoom {
                room_id: "ab3d7k".into()
            }
        );
        assert_eq!(second, first);
        assert_eq!(
            client.intent(),
            Some(RoomIntent::Join {
                code: "ab3d7k".into()
            })
        );
        assert_eq!(client.room_code().map(|c| c.to_string()), Some("AB3D7K".into()));
        client.close();
    }

    #[tokio::test]
    async fn test_gives_up_after_bounded_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            drop(ws);
            // Stop listening so every retry is refused
            drop(listener);
        });

        let client = SignalingClient::new(format!("ws://{}", addr), fast_policy(2));
        let mut status = client.watch_status();
        client.connect().await.unwrap();
        server.await.unwrap();

        let failed = wait_for(&mut status, ConnectionStatus::is_terminal).await;
        assert!(matches!(failed, ConnectionStatus::Failed { .. }));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_normal_closure_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "session over".into(),
                }))
                .await;
        });

        let client = SignalingClient::new(format!("ws://{}", addr), fast_policy(5));
        let mut status = client.watch_status();
        client.connect().await.unwrap();

        let closed = wait_for(&mut status, ConnectionStatus::is_terminal).await;
        assert_eq!(closed, ConnectionStatus::Closed);
    }
}
