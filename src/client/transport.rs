use tokio::sync::mpsc;

use crate::error::{Result, SignalError};
use crate::protocol::ClientMessage;

/// Outbound half of a signaling connection as seen by the negotiator and
/// state sync. Sending never blocks; it fails when the connection is down.
pub trait SignalingTransport: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<()>;
}

/// In-process transport backed by an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SignalingTransport for ChannelTransport {
    fn send(&self, message: ClientMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| SignalError::transport("signaling channel closed"))
    }
}
