//! Message Ingress
//!
//! The one place a message is created. The HTTP handlers and the socket session
//! both hand their send intent to [`MessageIngress::submit`], which validates it,
//! persists it and only then fans it out.

use std::sync::Arc;
use tracing::info;

use crate::error::{ChatError, ChatResult};
use crate::metrics::ServerMetrics;
use crate::models::{
    ConversationId, FileMeta, MessageDraft, MessageType, MessageView, NewMessage, UserId,
};
use crate::repository::ChatRepository;
use crate::ws::Broadcaster;

pub struct MessageIngress {
    repository: Arc<ChatRepository>,
    broadcaster: Arc<Broadcaster>,
    metrics: Arc<ServerMetrics>,
}

impl MessageIngress {
    pub fn new(
        repository: Arc<ChatRepository>,
        broadcaster: Arc<Broadcaster>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            repository,
            broadcaster,
            metrics,
        }
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Validate, persist, then notify. Delivery problems are absorbed by the
    /// broadcaster, so an `Ok` here means the message is durably stored.
    pub async fn submit(&self, draft: &MessageDraft) -> ChatResult<MessageView> {
        let new = validate(draft)?;
        let view = self.repository.create_message(&new).await?;
        self.metrics.message_persisted();

        info!(
            message_id = view.message.id,
            conversation_id = view.message.conversation_id,
            sender_id = view.message.sender_id,
            receiver_id = view.message.receiver_id,
            "Message persisted"
        );

        self.broadcaster.notify_new_message(&view).await;
        Ok(view)
    }

    /// Mark the conversation read for `user_id` and send the receipt. `origin` is
    /// the socket connection that asked, which already knows.
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        origin: Option<&str>,
    ) -> ChatResult<u64> {
        let count = self.repository.mark_read(conversation_id, user_id).await?;
        self.metrics.messages_read(count);

        info!(conversation_id, user_id, count, "Messages marked read");

        self.broadcaster
            .notify_messages_read(conversation_id, user_id, origin)
            .await;
        Ok(count)
    }
}

/// Turn a raw send intent into a [`NewMessage`], rejecting it before any store access.
pub fn validate(draft: &MessageDraft) -> ChatResult<NewMessage> {
    let sender_id = draft
        .sender_id
        .ok_or_else(|| ChatError::invalid("senderId is required"))?;
    let receiver_id = draft
        .receiver_id
        .ok_or_else(|| ChatError::invalid("receiverId is required"))?;
    if sender_id <= 0 {
        return Err(ChatError::invalid("senderId must be a positive integer"));
    }
    if receiver_id <= 0 {
        return Err(ChatError::invalid("receiverId must be a positive integer"));
    }
    if sender_id == receiver_id {
        return Err(ChatError::invalid("senderId and receiverId must differ"));
    }
    if let Some(id) = draft.conversation_id {
        if id <= 0 {
            return Err(ChatError::invalid("conversationId must be a positive integer"));
        }
    }

    let content = non_blank(draft.content.as_deref());
    let file_url = non_blank(draft.file_url.as_deref());
    if content.is_none() && file_url.is_none() {
        return Err(ChatError::invalid("A message needs content or a file"));
    }

    let file_type = non_blank(draft.file_type.as_deref());
    let message_type = match non_blank(draft.message_type.as_deref()) {
        Some(raw) => MessageType::parse(&raw)
            .ok_or_else(|| ChatError::invalid(format!("Unknown message type: {}", raw)))?,
        None if file_url.is_some() => MessageType::from_mime(file_type.as_deref()),
        None => MessageType::Text,
    };

    let file = match (message_type.is_text(), file_url) {
        (true, Some(_)) => {
            return Err(ChatError::invalid("Text messages cannot carry file metadata"));
        }
        (true, None) => None,
        (false, Some(url)) => Some(FileMeta {
            url,
            name: non_blank(draft.file_name.as_deref()),
            size: draft.file_size,
            mime: file_type,
        }),
        (false, None) => {
            return Err(ChatError::invalid(format!(
                "A {} message needs a fileUrl",
                message_type.as_str()
            )));
        }
    };

    if let Some(size) = file.as_ref().and_then(|f| f.size) {
        if size < 0 {
            return Err(ChatError::invalid("fileSize cannot be negative"));
        }
    }

    Ok(NewMessage {
        conversation_id: draft.conversation_id,
        sender_id,
        receiver_id,
        content,
        message_type,
        file,
    })
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
