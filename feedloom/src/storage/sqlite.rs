//! Embedded SQL storage backends.
//!
//! A single database file holds both tables. The connection is shared
//! behind an async mutex; every method runs its statements under that lock
//! so the stores present internally-synchronized methods to the pipeline.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{DedupKey, OutboxItem, OutboxStorage, PostStore};
use crate::Error;

/// Connection shared by the dedup store and the outbox.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Opens (or creates) the database file and ensures the schema exists.
pub fn open_database(path: &Path) -> Result<SharedConnection, Error> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS posts (
            key TEXT NOT NULL,
            post_id TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS outbox (
            id TEXT NOT NULL,
            data JSON NOT NULL,
            in_progress_at INTEGER,
            created_at INTEGER DEFAULT (strftime('%s', 'now')) NOT NULL
        );",
    )?;
    debug!(path = %path.display(), "database ready");
    Ok(Arc::new(Mutex::new(conn)))
}

/// Dedup store backed by the `posts` table. No uniqueness constraint is
/// enforced; reads tolerate duplicate rows.
pub struct SqlitePostStore {
    conn: SharedConnection,
}

impl SqlitePostStore {
    /// Wraps a shared connection.
    pub fn new(conn: SharedConnection) -> Self {
        SqlitePostStore { conn }
    }
}

#[async_trait]
impl PostStore for SqlitePostStore {
    async fn has_any(&self, key: &DedupKey) -> Result<bool, Error> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM posts WHERE key = ?1",
            params![key.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn is_processed(&self, key: &DedupKey, post_id: &str) -> Result<bool, Error> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM posts WHERE key = ?1 AND post_id = ?2",
            params![key.to_string(), post_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn mark_processed(&self, key: &DedupKey, post_ids: &[String]) -> Result<(), Error> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO posts (key, post_id) VALUES (?1, ?2)")?;
            for post_id in post_ids {
                let _ = stmt.execute(params![key.to_string(), post_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

/// Outbox storage backed by the `outbox` table. Items are serialized to
/// JSON; `get` claims in a single transaction so concurrent consumers
/// observe at most one handoff per item.
pub struct SqliteOutboxStorage {
    conn: SharedConnection,
}

impl SqliteOutboxStorage {
    /// Wraps a shared connection.
    pub fn new(conn: SharedConnection) -> Self {
        SqliteOutboxStorage { conn }
    }
}

#[async_trait]
impl OutboxStorage for SqliteOutboxStorage {
    async fn put(&self, item: &OutboxItem, now: i64) -> Result<(), Error> {
        let data = serde_json::to_string(item)?;
        let conn = self.conn.lock().await;
        let _ = conn.execute(
            "INSERT INTO outbox (id, data, created_at) VALUES (?1, ?2, ?3)",
            params![item.id, data, now],
        )?;
        Ok(())
    }

    async fn get(&self, now: i64) -> Result<Option<OutboxItem>, Error> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT id, data FROM outbox
                 WHERE in_progress_at IS NULL
                 ORDER BY created_at
                 LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((id, data)) = row else {
            return Ok(None);
        };

        let _ = tx.execute(
            "UPDATE outbox SET in_progress_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        tx.commit()?;

        Ok(Some(serde_json::from_str(&data)?))
    }

    async fn get_dead_letter(&self, now: i64, delta: i64) -> Result<Option<OutboxItem>, Error> {
        let conn = self.conn.lock().await;
        let row: Option<String> = conn
            .query_row(
                "SELECT data FROM outbox
                 WHERE in_progress_at IS NOT NULL
                 AND in_progress_at <= ?1
                 ORDER BY in_progress_at
                 LIMIT 1",
                params![now - delta],
                |row| row.get(0),
            )
            .optional()?;

        match row {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn commit(&self, id: &str) -> Result<(), Error> {
        let conn = self.conn.lock().await;
        let _ = conn.execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
        Ok(())
    }
}
