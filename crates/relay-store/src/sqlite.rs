use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::broadcast;
use tracing::info;

use crate::error::StoreError;
use crate::{now_secs, KeyValueStore};

const PRAGMAS: &str = "PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;";

const CREATE_TABLES: &str = "CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at);";

const PUBSUB_CAPACITY: usize = 256;

/// SQLite-backed key/value store.
///
/// rusqlite is not Send, so the connection sits behind a parking_lot Mutex;
/// every call is a short synchronous critical section. Expired rows are
/// purged lazily on read. Pub/sub is process-local: channels are tokio
/// broadcast senders keyed by name, not persisted.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    topics: DashMap<String, broadcast::Sender<String>>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

        info!(path = %path.display(), "store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            topics: DashMap::new(),
            path: path.to_owned(),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            topics: DashMap::new(),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for SqliteStore {
    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|t| now_secs() + t.as_secs() as i64);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            rusqlite::params![key, value, expires_at],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = now_secs();
        let conn = self.conn.lock();
        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM kv WHERE key = ?1",
                [key],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        match row {
            Some((_, Some(expires_at))) if expires_at <= now => {
                conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(removed > 0)
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let pattern = format!(
            "{}%",
            prefix
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_")
        );
        let now = now_secs();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv
             WHERE key LIKE ?1 ESCAPE '\\' AND (expires_at IS NULL OR expires_at > ?2)
             ORDER BY key",
        )?;
        let rows = stmt.query_map(rusqlite::params![pattern, now], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, '1', NULL)
             ON CONFLICT(key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)",
            [key],
        )?;
        let value: String = conn.query_row("SELECT value FROM kv WHERE key = ?1", [key], |r| r.get(0))?;
        value
            .parse::<i64>()
            .map_err(|e| StoreError::Serialization(format!("counter {key}: {e}")))
    }

    fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        let sender = self
            .topics
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(PUBSUB_CAPACITY).0)
            .clone();
        Ok(sender.send(payload.to_string()).unwrap_or(0))
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.topics
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(PUBSUB_CAPACITY).0)
            .subscribe()
    }

    fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let store = SqliteStore::in_memory().unwrap();
        store.put("connections:c1", "{}", None).unwrap();
        assert_eq!(store.get("connections:c1").unwrap().as_deref(), Some("{}"));

        assert!(store.delete("connections:c1").unwrap());
        assert!(!store.delete("connections:c1").unwrap());
        assert!(store.get("connections:c1").unwrap().is_none());
    }

    #[test]
    fn expired_entries_read_as_absent() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .put("metrics:m1", "1", Some(Duration::from_secs(0)))
            .unwrap();
        assert!(store.get("metrics:m1").unwrap().is_none());
        // The expired row was purged on read
        assert!(store.list_prefix("metrics:").unwrap().is_empty());
    }

    #[test]
    fn list_prefix_filters() {
        let store = SqliteStore::in_memory().unwrap();
        store.put("functions:echo", "a", None).unwrap();
        store.put("functions:resize", "b", None).unwrap();
        store.put("connections:c1", "c", None).unwrap();

        let entries = store.list_prefix("functions:").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "functions:echo");
        assert_eq!(entries[1].0, "functions:resize");
    }

    #[test]
    fn list_prefix_escapes_like_wildcards() {
        let store = SqliteStore::in_memory().unwrap();
        store.put("a_b:1", "x", None).unwrap();
        store.put("axb:1", "y", None).unwrap();

        let entries = store.list_prefix("a_b:").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "a_b:1");
    }

    #[test]
    fn incr_counts_from_one() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.incr("total_connections").unwrap(), 1);
        assert_eq!(store.incr("total_connections").unwrap(), 2);
        assert_eq!(store.incr("total_connections").unwrap(), 3);
    }

    #[test]
    fn pubsub_delivers_to_subscriber() {
        let store = SqliteStore::in_memory().unwrap();
        let mut rx = store.subscribe("updates");
        let delivered = store.publish("updates", "hello").unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(rx.try_recv().unwrap(), "hello");
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.publish("nobody", "hi").unwrap(), 0);
    }

    #[test]
    fn ping_succeeds() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.ping().is_ok());
    }

    #[test]
    fn open_file_store() {
        let dir = std::env::temp_dir().join(format!("relay-store-test-{}", uuid::Uuid::now_v7()));
        let path = dir.join("relay.db");
        let store = SqliteStore::open(&path).unwrap();
        store.put("k", "v", None).unwrap();
        drop(store);

        // Reopen — value survives
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        drop(store);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
