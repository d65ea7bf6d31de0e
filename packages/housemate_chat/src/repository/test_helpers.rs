use sqlx::sqlite::SqlitePoolOptions;

use crate::models::UserSummary;

/// Create a fresh ChatRepository backed by an in-memory SQLite database.
/// Each call returns an isolated database with all migrations applied.
pub async fn test_repository() -> super::ChatRepository {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    crate::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    super::ChatRepository::new(&crate::db::Database::single(pool))
}

/// Insert a profile row so the user can take part in conversations.
pub async fn seed_user(repo: &super::ChatRepository, id: i64, full_name: &str) {
    repo.upsert_user_profile(&UserSummary {
        id,
        full_name: full_name.to_string(),
        profile_picture: None,
    })
    .await
    .expect("Failed to seed user");
}

/// Repository with users 5 (Ada) and 9 (Grace), the pair used across scenarios.
pub async fn repository_with_pair() -> super::ChatRepository {
    let repo = test_repository().await;
    seed_user(&repo, 5, "Ada").await;
    seed_user(&repo, 9, "Grace").await;
    repo
}
