//! Live Socket Layer
//!
//! - Session Registry: which connections belong to which user and conversation rooms
//! - Fan-out Broadcaster: delivers new messages, read receipts and typing signals
//! - Socket handler: per-connection event dispatch with tempId confirmation

mod broadcast;
mod handler;
mod protocol;
mod registry;

pub use broadcast::Broadcaster;
pub use handler::handle_chat_socket;
pub use protocol::{
    ClientEvent, MarkReadPayload, SendMessagePayload, ServerEvent, TempId, TypingPayload,
};
pub use registry::SessionRegistry;
