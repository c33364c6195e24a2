pub mod outbox;
pub mod peers;
pub mod protocol;

pub use outbox::{MessageSender, Outbox};
pub use peers::PeerTracker;
pub use protocol::{
    InboundMessage, OutboundMessage, PeerMessage, ServerMessage, SharedFileEntry, SocketHandle,
    Token, TransferDirection, UndeliveredRequest, UserStatus,
};
