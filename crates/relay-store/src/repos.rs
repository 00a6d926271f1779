//! Typed views over the key/value store, one per persisted record family.

use std::sync::Arc;
use std::time::Duration;

use relay_core::{ConnectionId, ConnectionInfo, FunctionSpec};
use serde::Serialize;
use tracing::warn;

use crate::error::StoreError;
use crate::KeyValueStore;

const CONNECTION_PREFIX: &str = "connections:";
const CONNECTION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const FUNCTION_PREFIX: &str = "functions:";

const METRIC_PREFIX: &str = "metrics:";
const METRIC_TTL: Duration = Duration::from_secs(60 * 60);

/// Connection snapshots, keyed `connections:<id>` with a 24h expiry so a
/// crashed process leaves no permanent residue.
#[derive(Clone)]
pub struct ConnectionSnapshots {
    store: Arc<dyn KeyValueStore>,
}

impl ConnectionSnapshots {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn store(&self, info: &ConnectionInfo) -> Result<(), StoreError> {
        let key = format!("{CONNECTION_PREFIX}{}", info.id);
        let value = serde_json::to_string(info)?;
        self.store.put(&key, &value, Some(CONNECTION_TTL))
    }

    pub fn delete(&self, id: &ConnectionId) -> Result<bool, StoreError> {
        self.store.delete(&format!("{CONNECTION_PREFIX}{id}"))
    }

    /// All persisted snapshots. Entries that fail to parse are skipped.
    pub fn load_all(&self) -> Result<Vec<ConnectionInfo>, StoreError> {
        let entries = self.store.list_prefix(CONNECTION_PREFIX)?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_str(&value) {
                Ok(info) => Some(info),
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping unparseable connection snapshot");
                    None
                }
            })
            .collect())
    }
}

/// Registered function specs, keyed `functions:<name>`, no expiry.
#[derive(Clone)]
pub struct FunctionCatalog {
    store: Arc<dyn KeyValueStore>,
}

impl FunctionCatalog {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn store(&self, spec: &FunctionSpec) -> Result<(), StoreError> {
        let key = format!("{FUNCTION_PREFIX}{}", spec.name);
        let value = serde_json::to_string(spec)?;
        self.store.put(&key, &value, None)
    }

    pub fn delete(&self, name: &str) -> Result<bool, StoreError> {
        self.store.delete(&format!("{FUNCTION_PREFIX}{name}"))
    }

    pub fn load_all(&self) -> Result<Vec<FunctionSpec>, StoreError> {
        let entries = self.store.list_prefix(FUNCTION_PREFIX)?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_str(&value) {
                Ok(spec) => Some(spec),
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping unparseable function spec");
                    None
                }
            })
            .collect())
    }
}

/// Point-in-time metrics (`metrics:<name>`, 1h expiry) and counters.
#[derive(Clone)]
pub struct MetricsSink {
    store: Arc<dyn KeyValueStore>,
}

impl MetricsSink {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn set<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let key = format!("{METRIC_PREFIX}{name}");
        let value = serde_json::to_string(value)?;
        self.store.put(&key, &value, Some(METRIC_TTL))
    }

    pub fn incr_counter(&self, name: &str) -> Result<i64, StoreError> {
        self.store.incr(name)
    }
}
