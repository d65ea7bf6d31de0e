use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqliteRow};

use crate::error::{ChatError, ChatResult};
use crate::models::{
    Conversation, ConversationId, ConversationSummary, UserId, UserSummary, now_millis,
    ordered_pair,
};

use super::ChatRepository;
use super::messages::message_from_row;
use super::users::require_user;

pub(super) fn conversation_from_row(r: &SqliteRow) -> Conversation {
    Conversation {
        id: r.get("id"),
        user1_id: r.get("user1_id"),
        user2_id: r.get("user2_id"),
        last_message_at: r.get("last_message_at"),
        created_at: r.get("created_at"),
    }
}

pub(super) async fn fetch_conversation(
    conn: &mut SqliteConnection,
    id: ConversationId,
) -> Result<Option<Conversation>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, user1_id, user2_id, last_message_at, created_at
        FROM conversations
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await?;
    Ok(row.as_ref().map(conversation_from_row))
}

pub(super) async fn require_conversation(
    conn: &mut SqliteConnection,
    id: ConversationId,
) -> ChatResult<Conversation> {
    fetch_conversation(conn, id)
        .await?
        .ok_or_else(|| ChatError::not_found(format!("Conversation {} not found", id)))
}

/// Atomic upsert keyed on the ordered pair. When `touch_at` is set, an existing
/// row's `last_message_at` is moved to it; otherwise the existing row is untouched.
pub(super) async fn upsert_conversation(
    conn: &mut SqliteConnection,
    a: UserId,
    b: UserId,
    touch_at: Option<i64>,
) -> Result<Conversation, sqlx::Error> {
    let (user1_id, user2_id) = ordered_pair(a, b);
    let now = now_millis();
    let row = sqlx::query(
        r#"
        INSERT INTO conversations (user1_id, user2_id, last_message_at, created_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(user1_id, user2_id) DO UPDATE SET
            last_message_at = COALESCE(?, conversations.last_message_at)
        RETURNING id, user1_id, user2_id, last_message_at, created_at
        "#,
    )
    .bind(user1_id)
    .bind(user2_id)
    .bind(touch_at.unwrap_or(now))
    .bind(now)
    .bind(touch_at)
    .fetch_one(conn)
    .await?;
    Ok(conversation_from_row(&row))
}

pub(super) fn validate_pair(a: UserId, b: UserId) -> ChatResult<()> {
    if a <= 0 || b <= 0 {
        return Err(ChatError::invalid("User ids must be positive integers"));
    }
    if a == b {
        return Err(ChatError::invalid(
            "A conversation needs two different participants",
        ));
    }
    Ok(())
}

impl ChatRepository {
    /// Return the conversation for the unordered pair `{a, b}`, creating it if needed.
    /// Calling with the arguments swapped yields the same conversation.
    pub async fn get_or_create_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> ChatResult<Conversation> {
        validate_pair(a, b)?;

        let mut tx = self.writer.begin().await?;
        require_user(&mut tx, a).await?;
        require_user(&mut tx, b).await?;
        let conversation = upsert_conversation(&mut tx, a, b, None).await?;
        tx.commit().await?;

        Ok(conversation)
    }

    #[cfg(test)]
    pub async fn get_conversation(&self, id: ConversationId) -> ChatResult<Option<Conversation>> {
        let mut conn = self.pool.acquire().await?;
        Ok(fetch_conversation(&mut conn, id).await?)
    }

    /// Conversations the user takes part in, most recently active first, each with the
    /// other participant, the latest message and the user's unread count.
    pub async fn list_conversations(
        &self,
        user_id: UserId,
    ) -> ChatResult<Vec<ConversationSummary>> {
        if user_id <= 0 {
            return Err(ChatError::invalid("userId must be a positive integer"));
        }

        let mut conn = self.pool.acquire().await?;
        require_user(&mut conn, user_id).await?;

        let rows = sqlx::query(
            r#"
            SELECT c.id, c.user1_id, c.user2_id, c.last_message_at, c.created_at,
                   u.id AS other_id,
                   u.full_name AS other_full_name,
                   u.profile_picture AS other_profile_picture,
                   (SELECT COUNT(*) FROM messages um
                     WHERE um.conversation_id = c.id
                       AND um.receiver_id = ?
                       AND um.read = 0) AS unread_count,
                   lm.id AS lm_id,
                   lm.conversation_id AS lm_conversation_id,
                   lm.sender_id AS lm_sender_id,
                   lm.receiver_id AS lm_receiver_id,
                   lm.content AS lm_content,
                   lm.type AS lm_type,
                   lm.file_url AS lm_file_url,
                   lm.file_name AS lm_file_name,
                   lm.file_size AS lm_file_size,
                   lm.file_type AS lm_file_type,
                   lm.read AS lm_read,
                   lm.read_at AS lm_read_at,
                   lm.created_at AS lm_created_at
            FROM conversations c
            JOIN users u
              ON u.id = CASE WHEN c.user1_id = ? THEN c.user2_id ELSE c.user1_id END
            LEFT JOIN messages lm ON lm.id = (
                SELECT m.id FROM messages m
                WHERE m.conversation_id = c.id
                ORDER BY m.created_at DESC, m.id DESC
                LIMIT 1
            )
            WHERE c.user1_id = ? OR c.user2_id = ?
            ORDER BY c.last_message_at DESC, c.id DESC
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let last_message_id: Option<i64> = r.get("lm_id");
                ConversationSummary {
                    conversation: conversation_from_row(&r),
                    other_user: UserSummary {
                        id: r.get("other_id"),
                        full_name: r.get("other_full_name"),
                        profile_picture: r.get("other_profile_picture"),
                    },
                    last_message: last_message_id.map(|_| message_from_row(&r, "lm_")),
                    unread_count: r.get("unread_count"),
                }
            })
            .collect())
    }
}
