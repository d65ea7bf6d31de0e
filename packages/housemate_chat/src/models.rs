use chrono::Utc;
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type ConversationId = i64;
pub type MessageId = i64;

/// Current time as Unix epoch milliseconds, the unit of every stored timestamp.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Storage order for a participant pair: `(min, max)`.
pub fn ordered_pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Room name for a user's personal channel.
pub fn user_room(user_id: UserId) -> String {
    format!("user_{}", user_id)
}

/// Room name for a conversation channel.
pub fn conversation_room(conversation_id: ConversationId) -> String {
    format!("conversation_{}", conversation_id)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    File,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Video => "video",
            MessageType::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Some(MessageType::Text),
            "image" => Some(MessageType::Image),
            "video" => Some(MessageType::Video),
            "file" => Some(MessageType::File),
            _ => None,
        }
    }

    /// Pick a payload type from a MIME type such as `image/png`.
    pub fn from_mime(mime: Option<&str>) -> Self {
        match mime {
            Some(m) if m.starts_with("image/") => MessageType::Image,
            Some(m) if m.starts_with("video/") => MessageType::Video,
            _ => MessageType::File,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, MessageType::Text)
    }
}

/// Public profile fields of a user, as supplied by the profile collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub full_name: String,
    pub profile_picture: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub user1_id: UserId,
    pub user2_id: UserId,
    pub last_message_at: i64,
    pub created_at: i64,
}

impl Conversation {
    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.user1_id == user_id || self.user2_id == user_id
    }

    /// True when `{a, b}` is exactly this conversation's participant pair.
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        ordered_pair(a, b) == (self.user1_id, self.user2_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub file_type: Option<String>,
    pub read: bool,
    pub read_at: Option<i64>,
    pub created_at: i64,
}

/// A message joined with the display fields of both participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub sender: UserSummary,
    pub receiver: UserSummary,
}

/// One row of a user's conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub other_user: UserSummary,
    pub last_message: Option<Message>,
    pub unread_count: i64,
}

/// Unvalidated send intent, as received from either entry protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub sender_id: Option<UserId>,
    #[serde(default)]
    pub receiver_id: Option<UserId>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, rename = "type")]
    pub message_type: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub file_type: Option<String>,
}

/// File metadata attached to a non-text message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMeta {
    pub url: String,
    pub name: Option<String>,
    pub size: Option<i64>,
    pub mime: Option<String>,
}

/// A send intent that passed validation; the only input the store accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: Option<ConversationId>,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: Option<String>,
    pub message_type: MessageType,
    pub file: Option<FileMeta>,
}
