use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::error::{ChatError, ChatResult};
use crate::models::{
    ConversationId, Message, MessageId, MessageType, MessageView, NewMessage, UserId,
    UserSummary, now_millis,
};

use super::ChatRepository;
use super::conversations::{require_conversation, upsert_conversation, validate_pair};
use super::users::require_user;

/// Map a message row whose columns carry `prefix` (empty for a plain `messages` select).
pub(super) fn message_from_row(r: &SqliteRow, prefix: &str) -> Message {
    let col = |name: &str| format!("{}{}", prefix, name);
    let message_type: String = r.get(col("type").as_str());
    Message {
        id: r.get(col("id").as_str()),
        conversation_id: r.get(col("conversation_id").as_str()),
        sender_id: r.get(col("sender_id").as_str()),
        receiver_id: r.get(col("receiver_id").as_str()),
        content: r.get(col("content").as_str()),
        message_type: MessageType::parse(&message_type).unwrap_or_default(),
        file_url: r.get(col("file_url").as_str()),
        file_name: r.get(col("file_name").as_str()),
        file_size: r.get(col("file_size").as_str()),
        file_type: r.get(col("file_type").as_str()),
        read: r.get(col("read").as_str()),
        read_at: r.get(col("read_at").as_str()),
        created_at: r.get(col("created_at").as_str()),
    }
}

fn message_view_from_row(r: &SqliteRow) -> MessageView {
    MessageView {
        message: message_from_row(r, ""),
        sender: UserSummary {
            id: r.get("sender_id"),
            full_name: r.get("sender_full_name"),
            profile_picture: r.get("sender_profile_picture"),
        },
        receiver: UserSummary {
            id: r.get("receiver_id"),
            full_name: r.get("receiver_full_name"),
            profile_picture: r.get("receiver_profile_picture"),
        },
    }
}

const MESSAGE_VIEW_SELECT: &str = r#"
    SELECT m.id, m.conversation_id, m.sender_id, m.receiver_id, m.content, m.type,
           m.file_url, m.file_name, m.file_size, m.file_type, m.read, m.read_at, m.created_at,
           s.full_name AS sender_full_name, s.profile_picture AS sender_profile_picture,
           r.full_name AS receiver_full_name, r.profile_picture AS receiver_profile_picture
    FROM messages m
    JOIN users s ON s.id = m.sender_id
    JOIN users r ON r.id = m.receiver_id
"#;

impl ChatRepository {
    /// The single creation routine for messages.
    ///
    /// Resolves the conversation (reusing `conversation_id` when given, otherwise upserting
    /// the ordered pair), inserts the row and moves `last_message_at`, all in one
    /// transaction. `created_at` never goes backwards within a conversation, so id order
    /// and creation order agree.
    pub async fn create_message(&self, new: &NewMessage) -> ChatResult<MessageView> {
        validate_pair(new.sender_id, new.receiver_id)?;

        let mut tx = self.writer.begin().await?;

        let sender = require_user(&mut tx, new.sender_id).await?;
        let receiver = require_user(&mut tx, new.receiver_id).await?;

        let now = now_millis();
        let conversation = match new.conversation_id {
            Some(id) => {
                let conversation = require_conversation(&mut tx, id).await?;
                if !conversation.is_between(new.sender_id, new.receiver_id) {
                    return Err(ChatError::conflict(format!(
                        "Conversation {} is not between users {} and {}",
                        id, new.sender_id, new.receiver_id
                    )));
                }
                conversation
            }
            None => {
                upsert_conversation(&mut tx, new.sender_id, new.receiver_id, Some(now)).await?
            }
        };

        let file = new.file.as_ref();
        let row = sqlx::query(
            r#"
            INSERT INTO messages (
                conversation_id, sender_id, receiver_id, content, type,
                file_url, file_name, file_size, file_type, read, read_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL,
                MAX(?, COALESCE((SELECT MAX(created_at) FROM messages WHERE conversation_id = ?), 0)))
            RETURNING id, created_at
            "#,
        )
        .bind(conversation.id)
        .bind(new.sender_id)
        .bind(new.receiver_id)
        .bind(&new.content)
        .bind(new.message_type.as_str())
        .bind(file.map(|f| f.url.clone()))
        .bind(file.and_then(|f| f.name.clone()))
        .bind(file.and_then(|f| f.size))
        .bind(file.and_then(|f| f.mime.clone()))
        .bind(now)
        .bind(conversation.id)
        .fetch_one(&mut *tx)
        .await?;

        let id: MessageId = row.get("id");
        let created_at: i64 = row.get("created_at");

        sqlx::query(
            "UPDATE conversations SET last_message_at = MAX(last_message_at, ?) WHERE id = ?",
        )
        .bind(created_at)
        .bind(conversation.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(MessageView {
            message: Message {
                id,
                conversation_id: conversation.id,
                sender_id: new.sender_id,
                receiver_id: new.receiver_id,
                content: new.content.clone(),
                message_type: new.message_type,
                file_url: file.map(|f| f.url.clone()),
                file_name: file.and_then(|f| f.name.clone()),
                file_size: file.and_then(|f| f.size),
                file_type: file.and_then(|f| f.mime.clone()),
                read: false,
                read_at: None,
                created_at,
            },
            sender,
            receiver,
        })
    }

    /// Full history of a conversation, oldest first.
    pub async fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> ChatResult<Vec<MessageView>> {
        if conversation_id <= 0 {
            return Err(ChatError::invalid("conversationId must be a positive integer"));
        }

        let mut conn = self.pool.acquire().await?;
        require_conversation(&mut conn, conversation_id).await?;

        let sql = format!(
            "{} WHERE m.conversation_id = ? ORDER BY m.created_at ASC, m.id ASC",
            MESSAGE_VIEW_SELECT
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .fetch_all(&mut *conn)
            .await?;

        Ok(rows.iter().map(message_view_from_row).collect())
    }

    #[cfg(test)]
    pub async fn get_message_view(&self, id: MessageId) -> ChatResult<Option<MessageView>> {
        let sql = format!("{} WHERE m.id = ?", MESSAGE_VIEW_SELECT);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(message_view_from_row))
    }

    /// Flip every unread message addressed to `user_id` in the conversation to read.
    /// Returns the number of rows changed; a repeated call changes none.
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> ChatResult<u64> {
        if conversation_id <= 0 {
            return Err(ChatError::invalid("conversationId must be a positive integer"));
        }
        if user_id <= 0 {
            return Err(ChatError::invalid("userId must be a positive integer"));
        }

        let mut conn = self.writer.acquire().await?;
        let conversation = require_conversation(&mut conn, conversation_id).await?;
        require_user(&mut conn, user_id).await?;
        if !conversation.has_participant(user_id) {
            return Err(ChatError::conflict(format!(
                "User {} is not a participant of conversation {}",
                user_id, conversation_id
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE messages
            SET read = 1, read_at = ?
            WHERE conversation_id = ? AND receiver_id = ? AND read = 0
            "#,
        )
        .bind(now_millis())
        .bind(conversation_id)
        .bind(user_id)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    /// Unread messages addressed to `user_id` in one conversation. Listings compute the
    /// same count inline.
    #[cfg(test)]
    pub async fn unread_count(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> ChatResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ? AND receiver_id = ? AND read = 0",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
