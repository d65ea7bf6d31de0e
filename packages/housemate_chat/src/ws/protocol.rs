//! Socket Protocol Types
//!
//! Every text frame is one JSON object `{"event": <name>, "data": <payload>}`.
//! Event names are snake_case, payload fields camelCase. A `tempId` is whatever JSON
//! value the client chose and is echoed back unchanged.

use serde::{Deserialize, Deserializer, Serialize};

use crate::models::{ConversationId, MessageDraft, MessageView, UserId};

/// Client-chosen correlation token; clients send strings or numbers.
pub type TempId = serde_json::Value;

/// Events sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinUserRoom(#[serde(deserialize_with = "lenient_id")] UserId),
    /// Logout: the connection stays open but stops receiving the user's events.
    LeaveUserRoom(#[serde(deserialize_with = "lenient_id")] UserId),
    JoinConversation(#[serde(deserialize_with = "lenient_id")] ConversationId),
    LeaveConversation(#[serde(deserialize_with = "lenient_id")] ConversationId),
    SendMessage(SendMessagePayload),
    Typing(TypingPayload),
    MarkRead(MarkReadPayload),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    #[serde(flatten)]
    pub draft: MessageDraft,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<TempId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadPayload {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

/// Events sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Acknowledges `join_user_room`.
    Connected(ConnectedPayload),
    /// Delivery confirmation to the connection that sent the message.
    MessageSent(MessageSentPayload),
    NewMessage(MessageView),
    /// Rejected send; carries the client's tempId so it can roll back.
    MessageError(MessageErrorPayload),
    UserTyping(UserTypingPayload),
    MessagesRead(MessagesReadPayload),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSentPayload {
    #[serde(flatten)]
    pub message: MessageView,
    pub temp_id: Option<TempId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageErrorPayload {
    pub temp_id: Option<TempId>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTypingPayload {
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesReadPayload {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected(_) => "connected",
            ServerEvent::MessageSent(_) => "message_sent",
            ServerEvent::NewMessage(_) => "new_message",
            ServerEvent::MessageError(_) => "message_error",
            ServerEvent::UserTyping(_) => "user_typing",
            ServerEvent::MessagesRead(_) => "messages_read",
            ServerEvent::Error(_) => "error",
        }
    }
}

/// A frame that could not be turned into a [`ClientEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    /// Event name, when the envelope itself was readable.
    pub event: Option<String>,
    /// tempId salvaged from a malformed `send_message`.
    pub temp_id: Option<TempId>,
    pub reason: String,
}

impl FrameError {
    /// The event the client should get back for this frame.
    pub fn into_reply(self) -> ServerEvent {
        if self.event.as_deref() == Some("send_message") {
            ServerEvent::MessageError(MessageErrorPayload {
                temp_id: self.temp_id,
                message: self.reason,
            })
        } else {
            ServerEvent::error(self.reason)
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Decode one client text frame.
///
/// A `send_message` frame whose payload does not type-check still yields its
/// tempId, so the sender can be told which optimistic entry to roll back.
pub fn parse_client_frame(text: &str) -> Result<ClientEvent, FrameError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|e| FrameError {
        event: None,
        temp_id: None,
        reason: format!("Malformed frame: {}", e),
    })?;

    let event = envelope.event.clone();
    let temp_id = envelope
        .data
        .get("tempId")
        .filter(|v| !v.is_null())
        .cloned();

    let frame = serde_json::json!({ "event": envelope.event, "data": envelope.data });
    serde_json::from_value::<ClientEvent>(frame).map_err(|e| FrameError {
        reason: format!("Invalid {} payload: {}", event, e),
        event: Some(event),
        temp_id,
    })
}

/// Accepts an id sent either as a JSON number or as a numeric string.
fn lenient_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Number(i64),
        Text(String),
    }

    match Id::deserialize(deserializer)? {
        Id::Number(n) => Ok(n),
        Id::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid id {:?}", s))),
    }
}
