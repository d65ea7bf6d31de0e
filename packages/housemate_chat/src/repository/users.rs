use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqliteRow};

use crate::error::{ChatError, ChatResult};
use crate::models::{UserId, UserSummary, now_millis};

use super::ChatRepository;

pub(super) fn user_from_row(r: &SqliteRow) -> UserSummary {
    UserSummary {
        id: r.get("id"),
        full_name: r.get("full_name"),
        profile_picture: r.get("profile_picture"),
    }
}

/// Look up a user on an already-acquired connection (or open transaction).
pub(super) async fn fetch_user(
    conn: &mut SqliteConnection,
    id: UserId,
) -> Result<Option<UserSummary>, sqlx::Error> {
    let row = sqlx::query("SELECT id, full_name, profile_picture FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?;
    Ok(row.as_ref().map(user_from_row))
}

/// Like [`fetch_user`], but a missing user is a `NotFound`.
pub(super) async fn require_user(
    conn: &mut SqliteConnection,
    id: UserId,
) -> ChatResult<UserSummary> {
    fetch_user(conn, id)
        .await?
        .ok_or_else(|| ChatError::not_found(format!("User {} not found", id)))
}

impl ChatRepository {
    /// Insert or refresh the public profile fields of a user.
    pub async fn upsert_user_profile(&self, user: &UserSummary) -> ChatResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, full_name, profile_picture, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                full_name = excluded.full_name,
                profile_picture = excluded.profile_picture
            "#,
        )
        .bind(user.id)
        .bind(&user.full_name)
        .bind(&user.profile_picture)
        .bind(now_millis())
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn get_user_summary(&self, id: UserId) -> ChatResult<Option<UserSummary>> {
        let mut conn = self.pool.acquire().await?;
        Ok(fetch_user(&mut conn, id).await?)
    }
}
