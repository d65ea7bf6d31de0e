use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::config::HousemateConfig;

/// Two pools over one database file. SQLite admits a single writer at a time, so every
/// write goes through `writer`, which holds one connection; reads use `pool`.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
    pub writer: SqlitePool,
}

impl Database {
    pub async fn new(config: &HousemateConfig) -> Result<Self> {
        info!("Connecting to database: {}", config.db_path.display());

        let options = SqliteConnectOptions::from_str(&config.db_url())
            .with_context(|| format!("Invalid database url: {}", config.db_url()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await
            .with_context(|| format!("Failed to connect to database: {}", config.db_url()))?;

        info!("Running database migrations...");
        self::run_migrations(&writer).await?;

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to connect to database: {}", config.db_url()))?;

        info!("Database initialized successfully");

        Ok(Self { pool, writer })
    }

    /// Reads and writes share one pool. Used for single-connection in-memory databases.
    #[cfg(test)]
    pub fn single(pool: SqlitePool) -> Self {
        Self {
            writer: pool.clone(),
            pool,
        }
    }

    pub async fn get_stats(&self) -> Result<DbStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM users) as user_count,
                (SELECT COUNT(*) FROM conversations) as conversation_count,
                (SELECT COUNT(*) FROM messages) as message_count,
                (SELECT COUNT(*) FROM messages WHERE read = 0) as unread_count
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DbStats {
            users: row.try_get::<i64, _>("user_count").unwrap_or(0) as u64,
            conversations: row.try_get::<i64, _>("conversation_count").unwrap_or(0) as u64,
            messages: row.try_get::<i64, _>("message_count").unwrap_or(0) as u64,
            unread_messages: row.try_get::<i64, _>("unread_count").unwrap_or(0) as u64,
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub users: u64,
    pub conversations: u64,
    pub messages: u64,
    pub unread_messages: u64,
}

/// Current schema version - increment when adding migrations
const SCHEMA_VERSION: i64 = 1;

pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (unixepoch()),
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await
            .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        anyhow::bail!(
            "Database schema version {} is newer than supported version {}. Please upgrade the application.",
            current_version,
            SCHEMA_VERSION
        );
    }

    if current_version == SCHEMA_VERSION {
        info!(
            "Database schema is up to date (version {})",
            current_version
        );
        return Ok(());
    }

    info!(
        "Migrating database from version {} to {}",
        current_version, SCHEMA_VERSION
    );

    // Read-side copy of the profile collaborator's users
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            full_name TEXT NOT NULL,
            profile_picture TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per unordered pair, stored as (min, max)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user1_id INTEGER NOT NULL REFERENCES users(id),
            user2_id INTEGER NOT NULL REFERENCES users(id),
            last_message_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE (user1_id, user2_id),
            CHECK (user1_id < user2_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_conv_user1 ON conversations(user1_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_conv_user2 ON conversations(user2_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_conv_last_message ON conversations(last_message_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id),
            sender_id INTEGER NOT NULL REFERENCES users(id),
            receiver_id INTEGER NOT NULL REFERENCES users(id),
            content TEXT,
            type TEXT NOT NULL DEFAULT 'text',
            file_url TEXT,
            file_name TEXT,
            file_size INTEGER,
            file_type TEXT,
            read INTEGER NOT NULL DEFAULT 0,
            read_at INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_msg_conversation ON messages(conversation_id, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_msg_unread ON messages(conversation_id, receiver_id, read)",
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT INTO schema_version (version, description) VALUES (?, ?)")
        .bind(SCHEMA_VERSION)
        .bind("Initial messaging schema")
        .execute(pool)
        .await?;

    info!("Database migrated to version {}", SCHEMA_VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn newer_schema_is_rejected() {
        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(SCHEMA_VERSION + 1)
            .execute(&pool)
            .await
            .unwrap();

        assert!(run_migrations(&pool).await.is_err());
    }

    #[tokio::test]
    async fn conversation_pair_must_be_ordered() {
        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();
        for id in [5_i64, 9] {
            sqlx::query("INSERT INTO users (id, full_name, created_at) VALUES (?, 'u', 0)")
                .bind(id)
                .execute(&pool)
                .await
                .unwrap();
        }

        let reversed = sqlx::query(
            "INSERT INTO conversations (user1_id, user2_id, last_message_at, created_at) VALUES (9, 5, 0, 0)",
        )
        .execute(&pool)
        .await;
        assert!(reversed.is_err());

        sqlx::query(
            "INSERT INTO conversations (user1_id, user2_id, last_message_at, created_at) VALUES (5, 9, 0, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();
        let duplicate = sqlx::query(
            "INSERT INTO conversations (user1_id, user2_id, last_message_at, created_at) VALUES (5, 9, 0, 0)",
        )
        .execute(&pool)
        .await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn file_database_enables_pragmas() {
        let tmp = tempfile::tempdir().unwrap();
        let config = HousemateConfig::new(Some(tmp.path().to_path_buf())).unwrap();
        let db = Database::new(&config).await.unwrap();

        // Every pooled connection, not just the first, gets the options
        for pool in [&db.pool, &db.writer] {
            let mut conns = Vec::new();
            for _ in 0..pool.options().get_max_connections() {
                conns.push(pool.acquire().await.unwrap());
            }
            for conn in conns.iter_mut() {
                let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
                    .fetch_one(&mut **conn)
                    .await
                    .unwrap();
                assert_eq!(fk, 1);
                let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
                    .fetch_one(&mut **conn)
                    .await
                    .unwrap();
                assert_eq!(mode, "wal");
            }
        }
    }

    #[tokio::test]
    async fn stats_on_empty_database() {
        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();
        let db = Database::single(pool);
        let stats = db.get_stats().await.unwrap();
        assert_eq!(stats.users, 0);
        assert_eq!(stats.messages, 0);
    }
}
