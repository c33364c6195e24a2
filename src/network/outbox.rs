use super::protocol::{OutboundMessage, PeerMessage, ServerMessage, SocketHandle};
use crate::transfer::TransferEvent;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

pub type MessageSender = mpsc::UnboundedSender<OutboundMessage>;

const EVENT_CAPACITY: usize = 4096;

/// Everything leaving the engine: protocol messages for the networking layer
/// and state change events for subscribers.
#[derive(Debug, Clone)]
pub struct Outbox {
    messages: MessageSender,
    events: broadcast::Sender<TransferEvent>,
}

impl Outbox {
    pub fn new(messages: MessageSender) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { messages, events }
    }

    /// Outbox plus the receiving end the networking layer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn send(&self, message: OutboundMessage) {
        if let Err(e) = self.messages.send(message) {
            warn!("Networking layer is gone, dropping message: {:?}", e.0);
        }
    }

    pub fn send_to_peer(&self, user: &str, message: PeerMessage) {
        self.send(OutboundMessage::Peer {
            user: user.to_string(),
            message,
        });
    }

    pub fn send_to_server(&self, message: ServerMessage) {
        self.send(OutboundMessage::Server(message));
    }

    pub fn close_connection(&self, socket: SocketHandle) {
        self.send(OutboundMessage::CloseConnection { socket });
    }

    /// Fire and forget; having no subscribers is fine.
    pub fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }
}
