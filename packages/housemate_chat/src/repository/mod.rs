// Conversation Store: each entity lives in its own file with `impl ChatRepository`.

use sqlx::sqlite::SqlitePool;

use crate::db::Database;

mod conversations;
mod messages;
mod users;

#[cfg(test)]
pub(crate) mod test_helpers;

#[derive(Clone)]
pub struct ChatRepository {
    pub(crate) pool: SqlitePool,
    /// Single-connection pool every write transaction runs on.
    pub(crate) writer: SqlitePool,
}

impl ChatRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool.clone(),
            writer: db.writer.clone(),
        }
    }
}
