pub mod error;
pub mod memory;
pub mod repos;
pub mod sqlite;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use repos::{ConnectionSnapshots, FunctionCatalog, MetricsSink};
pub use sqlite::SqliteStore;

use std::time::Duration;

use tokio::sync::broadcast;

/// Durable key/value persistence plus pub/sub, as seen by the broker core.
///
/// Persistence through this interface is best-effort everywhere: callers log
/// failures and carry on; the live in-memory state never depends on it.
pub trait KeyValueStore: Send + Sync {
    /// Store a value, optionally expiring after `ttl`.
    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Fetch a value. Expired entries read as absent.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Remove a key. Returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// All live `(key, value)` pairs whose key starts with `prefix`.
    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;

    /// Atomically increment a counter, returning the new value.
    fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Publish a payload to a channel. Returns the number of subscribers
    /// that received it.
    fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError>;

    /// Subscribe to a channel.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;

    /// Liveness check for the health endpoint.
    fn ping(&self) -> Result<(), StoreError>;
}

pub(crate) fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
