//! Live connection table and message-delivery fabric.
//!
//! The registry owns every connection's bounded outbound queue. Closing a
//! connection removes its entry, which drops the only `Sender` — the queue
//! itself is the closed sentinel, so there is no separate flag a sender
//! could read stale.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_core::{ConnectionId, ConnectionInfo, ConnectionStats, RelayError, SseMessage};
use relay_store::{ConnectionSnapshots, KeyValueStore, MetricsSink};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One live streaming connection. Created and destroyed exclusively by the
/// registry; the stream that serves it only reads.
pub struct Connection {
    pub id: ConnectionId,
    pub client_id: String,
    pub user_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    tx: mpsc::Sender<SseMessage>,
    last_seen: AtomicU64,
}

impl Connection {
    fn enqueue(&self, message: SseMessage) -> Result<(), RelayError> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %self.id, "outbound queue full, dropping message");
                Err(RelayError::QueueFull(self.id.to_string()))
            }
            Err(TrySendError::Closed(_)) => Err(RelayError::ConnectionNotFound(self.id.to_string())),
        }
    }

    fn last_seen_secs(&self) -> u64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    /// Serializable snapshot for persistence and the admin surface.
    pub fn info(&self) -> ConnectionInfo {
        let last_seen = DateTime::from_timestamp(self.last_seen_secs() as i64, 0)
            .unwrap_or_else(Utc::now);
        ConnectionInfo {
            id: self.id.clone(),
            client_id: self.client_id.clone(),
            user_id: self.user_id.clone(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            last_seen,
            active: true,
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all live connections.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    snapshots: ConnectionSnapshots,
    metrics: MetricsSink,
    queue_capacity: usize,
    started_at: Instant,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, queue_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            snapshots: ConnectionSnapshots::new(store.clone()),
            metrics: MetricsSink::new(store),
            queue_capacity,
            started_at: Instant::now(),
        }
    }

    /// Create a connection and return it with the receiving end of its
    /// queue. Never fails; persistence and metrics are best-effort.
    pub fn open(
        &self,
        client_id: impl Into<String>,
        user_id: Option<String>,
        metadata: HashMap<String, String>,
    ) -> (Arc<Connection>, mpsc::Receiver<SseMessage>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let conn = Arc::new(Connection {
            id: ConnectionId::new(),
            client_id: client_id.into(),
            user_id,
            metadata,
            created_at: Utc::now(),
            tx,
            last_seen: AtomicU64::new(now_secs()),
        });
        self.connections.insert(conn.id.clone(), Arc::clone(&conn));

        if let Err(err) = self.snapshots.store(&conn.info()) {
            warn!(connection_id = %conn.id, error = %err, "failed to persist connection snapshot");
        }
        if let Err(err) = self.metrics.incr_counter("total_connections") {
            warn!(error = %err, "failed to increment connection counter");
        }

        info!(connection_id = %conn.id, client_id = %conn.client_id, "connection opened");
        (conn, rx)
    }

    /// Tear a connection down. Removing the entry drops its `Sender`, so
    /// the queue closes exactly once and later sends report not-found.
    /// No-op on unknown ids.
    pub fn close(&self, id: &ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(id) {
            if let Err(err) = self.snapshots.delete(id) {
                warn!(connection_id = %id, error = %err, "failed to delete connection snapshot");
            }
            info!(connection_id = %id, client_id = %conn.client_id, "connection closed");
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Non-blocking targeted delivery. A full queue drops this message and
    /// keeps the older ones; the caller is never stalled.
    pub fn send(&self, id: &ConnectionId, message: SseMessage) -> Result<(), RelayError> {
        let conn = self
            .connections
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RelayError::ConnectionNotFound(id.to_string()))?;
        conn.enqueue(message)
    }

    pub fn connections_for_client(&self, client_id: &str) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().client_id == client_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn all_connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Fan out to every connection sharing a logical client id. Per-target
    /// failures are independent and logged, never aggregated.
    pub fn broadcast_to_client(&self, client_id: &str, message: &SseMessage) {
        for conn in self.connections_for_client(client_id) {
            if let Err(err) = conn.enqueue(message.clone()) {
                debug!(connection_id = %conn.id, client_id, error = %err, "group delivery failed");
            }
        }
    }

    /// Fan out to every live connection.
    pub fn broadcast_to_all(&self, message: &SseMessage) {
        for conn in self.all_connections() {
            if let Err(err) = conn.enqueue(message.clone()) {
                debug!(connection_id = %conn.id, error = %err, "broadcast delivery failed");
            }
        }
    }

    /// Refresh a connection's liveness timestamp.
    pub fn touch(&self, id: &ConnectionId) {
        if let Some(entry) = self.connections.get(id) {
            let conn = entry.value();
            conn.last_seen.store(now_secs(), Ordering::Relaxed);
            if let Err(err) = self.snapshots.store(&conn.info()) {
                warn!(connection_id = %id, error = %err, "failed to refresh connection snapshot");
            }
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut breakdown: HashMap<String, usize> = HashMap::new();
        for entry in self.connections.iter() {
            *breakdown.entry(entry.value().client_id.clone()).or_default() += 1;
        }
        ConnectionStats {
            total_connections: self.connections.len(),
            unique_clients: breakdown.len(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            clients_breakdown: breakdown,
        }
    }

    fn publish_stats(&self) {
        let stats = self.stats();
        if let Err(err) = self.metrics.set("connection_stats", &stats) {
            warn!(error = %err, "failed to record connection stats metric");
        }
    }

    /// Remove every connection whose last liveness refresh is older than
    /// `stale_after`. Returns the number removed.
    pub fn reap_stale(&self, stale_after: Duration) -> usize {
        let now = now_secs();
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| now.saturating_sub(entry.value().last_seen_secs()) > stale_after.as_secs())
            .map(|entry| entry.value().id.clone())
            .collect();

        for id in &stale {
            info!(connection_id = %id, "reaping stale connection");
            self.close(id);
        }
        stale.len()
    }

    /// Close every connection and leave the table empty. Called once at
    /// process teardown.
    pub fn shutdown(&self) {
        info!(count = self.connections.len(), "closing all connections");
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.close(&id);
        }
    }
}

/// Periodic registry-wide heartbeat broadcast; also records the stats
/// snapshot as a metric.
pub fn spawn_heartbeat_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume first immediate tick
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    registry.broadcast_to_all(&SseMessage::heartbeat());
                    registry.publish_stats();
                }
            }
        }
        debug!("heartbeat loop stopped");
    })
}

/// Periodic stale-connection reaper.
pub fn spawn_reaper_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    stale_after: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.reap_stale(stale_after);
                    if removed > 0 {
                        info!(removed, "stale connection cleanup");
                    }
                }
            }
        }
        debug!("reaper loop stopped");
    })
}
