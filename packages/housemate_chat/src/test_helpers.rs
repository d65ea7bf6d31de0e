use std::sync::Arc;

use crate::AppState;
use crate::config::ServerConfig;
use crate::db::Database;
use crate::repository::test_helpers::seed_user;

/// Build a fully-wired `AppState` backed by an in-memory SQLite database.
/// Suitable for handler tests that exercise real SQL queries without I/O.
///
/// Returns `(AppState, TempDir)`. Callers hold the `TempDir` for the lifetime
/// of the test as scratch space.
pub async fn test_app_state() -> (AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");

    crate::db::run_migrations(&pool).await.expect("migrations");

    let state = AppState::new(
        Arc::new(ServerConfig::default()),
        Arc::new(Database::single(pool)),
    );

    (state, tmp)
}

/// Like `test_app_state`, with users 5 (Ada) and 9 (Grace) in the profile table.
pub async fn test_app_state_with_pair() -> (AppState, tempfile::TempDir) {
    let (state, tmp) = test_app_state().await;
    seed_user(&state.repository, 5, "Ada").await;
    seed_user(&state.repository, 9, "Grace").await;
    (state, tmp)
}
