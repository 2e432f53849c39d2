use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use crate::protocol::{ClientMessage, ServerMessage};
use crate::signaling::{SignalingHandler, SignalingServer};

pub async fn handle_signal_websocket(websocket: WebSocket, server: Arc<SignalingServer>) {
    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let handler = SignalingHandler::connect(server, tx).await;
    let participant = handler.participant().clone();

    // Spawn task to send messages to client
    let sender_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize server message");
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::text(text)).await {
                tracing::debug!(error = %e, "Failed to send WebSocket message");
                break;
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) if message.is_close() => break,
            Ok(message) => handle_websocket_message(&handler, message).await,
            Err(e) => {
                tracing::warn!(participant_id = %participant, error = %e, "WebSocket error");
                break;
            }
        }
    }

    handler.cleanup().await;
    sender_task.abort();
    tracing::debug!(participant_id = %participant, "Signaling WebSocket closed");
}

const FRAME_PREVIEW_CHARS: usize = 128;

/// Leading characters of a client frame, bounded for logging.
fn frame_preview(text: &str) -> &str {
    match text.char_indices().nth(FRAME_PREVIEW_CHARS) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

async fn handle_websocket_message(handler: &SignalingHandler, message: Message) {
    let Ok(text) = message.to_str() else {
        return;
    };

    match serde_json::from_str::<ClientMessage>(text) {
        Ok(client_message) => handler.handle_message(client_message).await,
        Err(e) => {
            tracing::warn!(
                participant_id = %handler.participant(),
                error = %e,
                frame_len = text.len(),
                frame_prefix = %frame_preview(text),
                "Failed to parse signaling message"
            );
            handler.reject(format!("Invalid message: {}", e));
        }
    }
}
