pub mod conversations;
pub mod health;
pub mod messages;
pub mod websocket;

// Re-export all handlers for easy route registration
pub use conversations::{list_conversations, open_conversation};
pub use health::{
    health_handler, health_live_handler, health_ready_handler, metrics_handler, stats_handler,
};
pub use messages::{create_message, list_messages, mark_messages_read};
pub use websocket::socket_handler;

use crate::error::{ChatError, ChatResult};

/// Parse a required positive id from a query-string value.
pub(crate) fn parse_id(raw: Option<&str>, field: &str) -> ChatResult<i64> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ChatError::invalid(format!("{} is required", field)))?;
    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ChatError::invalid(format!(
            "{} must be a positive integer",
            field
        ))),
    }
}
