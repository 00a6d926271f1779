use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::{now_secs, KeyValueStore};

const PUBSUB_CAPACITY: usize = 256;

struct Entry {
    value: String,
    expires_at: Option<i64>,
}

impl Entry {
    fn expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// In-memory key/value store with the same expiry semantics as the SQLite
/// store. Used by tests and as a stand-in when no durable store is wanted.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    topics: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|t| now_secs() + t.as_secs() as i64);
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = now_secs();
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(entry) if entry.expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let now = now_secs();
        let entries = self.entries.read();
        let mut out: Vec<(String, String)> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.expired(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut entries = self.entries.write();
        let next = match entries.get(key) {
            Some(entry) => entry
                .value
                .parse::<i64>()
                .map_err(|e| StoreError::Serialization(format!("counter {key}: {e}")))?
                + 1,
            None => 1,
        };
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
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
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let store = MemoryStore::new();
        store.put("k", "v", None).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        assert!(store.delete("k").unwrap());
        assert!(store.get("k").unwrap().is_none());
    }

    #[test]
    fn ttl_expires() {
        let store = MemoryStore::new();
        store.put("k", "v", Some(Duration::from_secs(0))).unwrap();
        assert!(store.get("k").unwrap().is_none());
    }

    #[test]
    fn list_prefix_sorted() {
        let store = MemoryStore::new();
        store.put("p:b", "2", None).unwrap();
        store.put("p:a", "1", None).unwrap();
        store.put("q:c", "3", None).unwrap();

        let entries = store.list_prefix("p:").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "p:a");
    }

    #[test]
    fn incr_monotonic() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("c").unwrap(), 1);
        assert_eq!(store.incr("c").unwrap(), 2);
    }

    #[test]
    fn pubsub_roundtrip() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("ch");
        store.publish("ch", "msg").unwrap();
        assert_eq!(rx.try_recv().unwrap(), "msg");
    }
}
