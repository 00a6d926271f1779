//! Registry of invokable backend functions and their availability state.
//!
//! Availability is a two-state machine per target (active ⇄ inactive),
//! driven only by the periodic health probes. Registration always starts a
//! target as active; the dispatcher consults the flag as a circuit breaker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use relay_core::{FunctionSpec, FunctionStats, RelayError};
use relay_store::{FunctionCatalog, KeyValueStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct FunctionRegistry {
    functions: DashMap<String, FunctionSpec>,
    catalog: FunctionCatalog,
}

impl FunctionRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            functions: DashMap::new(),
            catalog: FunctionCatalog::new(store),
        }
    }

    /// Load persisted specs. Called once at startup, before any invocation
    /// traffic; a load failure starts with an empty table.
    pub fn load_from_store(&self) {
        match self.catalog.load_all() {
            Ok(specs) => {
                let count = specs.len();
                for spec in specs {
                    self.functions.insert(spec.name.clone(), spec);
                }
                info!(count, "loaded functions from store");
            }
            Err(err) => {
                warn!(error = %err, "failed to load functions from store, starting empty");
            }
        }
    }

    /// Upsert by name — last write wins, and a re-registered target is
    /// active again. A persistence failure is surfaced to the caller, but
    /// the in-memory upsert has already taken effect.
    pub fn register(&self, mut spec: FunctionSpec) -> Result<FunctionSpec, RelayError> {
        if spec.name.is_empty() {
            return Err(RelayError::InvalidInput("function name is required".into()));
        }
        if spec.endpoint.is_empty() {
            return Err(RelayError::InvalidInput("function endpoint is required".into()));
        }
        if spec.method.is_empty() {
            spec.method = "POST".into();
        }
        if spec.timeout_secs == 0 {
            spec.timeout_secs = 30;
        }
        spec.is_active = true;
        let now = Utc::now();
        spec.created_at = now;
        spec.updated_at = now;

        self.functions.insert(spec.name.clone(), spec.clone());
        info!(function = %spec.name, endpoint = %spec.endpoint, "registered function");

        self.catalog
            .store(&spec)
            .map_err(|e| RelayError::Persistence(e.to_string()))?;
        Ok(spec)
    }

    pub fn get(&self, name: &str) -> Option<FunctionSpec> {
        self.functions.get(name).map(|entry| entry.clone())
    }

    pub fn remove(&self, name: &str) -> Result<(), RelayError> {
        if self.functions.remove(name).is_none() {
            return Err(RelayError::FunctionNotFound(name.to_string()));
        }
        if let Err(err) = self.catalog.delete(name) {
            warn!(function = %name, error = %err, "failed to delete persisted function");
        }
        info!(function = %name, "removed function");
        Ok(())
    }

    /// Flip the availability flag and stamp `updated_at`. Driven by the
    /// probe loop; never required externally.
    pub fn set_active(&self, name: &str, active: bool) -> Result<(), RelayError> {
        let spec = {
            let Some(mut entry) = self.functions.get_mut(name) else {
                return Err(RelayError::FunctionNotFound(name.to_string()));
            };
            entry.is_active = active;
            entry.updated_at = Utc::now();
            entry.clone()
        };
        if let Err(err) = self.catalog.store(&spec) {
            warn!(function = %name, error = %err, "failed to persist function status");
        }
        debug!(function = %name, active, "function status updated");
        Ok(())
    }

    pub fn all_functions(&self) -> Vec<FunctionSpec> {
        self.functions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn active_functions(&self) -> HashMap<String, FunctionSpec> {
        self.functions
            .iter()
            .filter(|entry| entry.value().is_active)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn stats(&self) -> FunctionStats {
        let total = self.functions.len();
        let active = self.functions.iter().filter(|entry| entry.value().is_active).count();
        FunctionStats {
            total_functions: total,
            active_functions: active,
            inactive_functions: total - active,
        }
    }
}

/// Periodic health probing. Every tick snapshots the table and spawns one
/// detached probe per target with its own timeout, so a slow target never
/// delays the sweep or the next tick. Inactive targets are probed too —
/// that is the only road back to active.
pub fn spawn_probe_task(
    registry: Arc<FunctionRegistry>,
    interval: Duration,
    probe_timeout: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let client = reqwest::Client::new();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume first immediate tick
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for spec in registry.all_functions() {
                        let registry = Arc::clone(&registry);
                        let client = client.clone();
                        tokio::spawn(async move {
                            probe_target(&registry, &client, &spec, probe_timeout).await;
                        });
                    }
                }
            }
        }
        debug!("health probe loop stopped");
    })
}

/// One probe: GET `<endpoint>/health` with the target's custom headers.
/// Transport errors and non-2xx statuses both count as unhealthy.
async fn probe_target(
    registry: &FunctionRegistry,
    client: &reqwest::Client,
    spec: &FunctionSpec,
    timeout: Duration,
) {
    let url = format!("{}/health", spec.endpoint.trim_end_matches('/'));
    let mut request = client.get(&url).timeout(timeout);
    for (key, value) in &spec.headers {
        request = request.header(key.as_str(), value.as_str());
    }

    let healthy = match request.send().await {
        Ok(response) => {
            let ok = response.status().is_success();
            if !ok {
                warn!(function = %spec.name, status = %response.status(), "unhealthy probe status");
            }
            ok
        }
        Err(err) => {
            warn!(function = %spec.name, error = %err, "health probe failed");
            false
        }
    };

    if healthy && !spec.is_active {
        info!(function = %spec.name, "function is back online");
        let _ = registry.set_active(&spec.name, true);
    } else if !healthy && spec.is_active {
        let _ = registry.set_active(&spec.name, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use relay_store::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn spec(name: &str, endpoint: &str) -> FunctionSpec {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "endpoint": endpoint,
        }))
        .unwrap()
    }

    fn registry() -> (Arc<FunctionRegistry>, Arc<dyn KeyValueStore>) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        (Arc::new(FunctionRegistry::new(store.clone())), store)
    }

    /// Serve `/health`, toggled by a flag, on an ephemeral port.
    async fn spawn_health_server(healthy: Arc<AtomicBool>) -> String {
        let app = Router::new().route(
            "/health",
            get(move || {
                let healthy = healthy.clone();
                async move {
                    if healthy.load(Ordering::Relaxed) {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn register_applies_defaults_and_activates() {
        let (registry, _) = registry();
        let stored = registry.register(spec("echo", "http://fn.local/echo")).unwrap();
        assert_eq!(stored.method, "POST");
        assert_eq!(stored.timeout_secs, 30);
        assert!(stored.is_active);
    }

    #[tokio::test]
    async fn register_rejects_missing_fields() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.register(spec("", "http://fn.local")),
            Err(RelayError::InvalidInput(_))
        ));
        assert!(matches!(
            registry.register(spec("echo", "")),
            Err(RelayError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn reregistration_overwrites_and_reactivates() {
        let (registry, _) = registry();
        registry.register(spec("echo", "http://old.local")).unwrap();
        registry.set_active("echo", false).unwrap();
        assert!(!registry.get("echo").unwrap().is_active);

        registry.register(spec("echo", "http://new.local")).unwrap();
        let current = registry.get("echo").unwrap();
        assert_eq!(current.endpoint, "http://new.local");
        assert!(current.is_active);
        assert_eq!(registry.stats().total_functions, 1);
    }

    #[tokio::test]
    async fn register_persists_to_catalog() {
        let (registry, store) = registry();
        registry.register(spec("echo", "http://fn.local")).unwrap();
        assert!(store.get("functions:echo").unwrap().is_some());

        registry.remove("echo").unwrap();
        assert!(store.get("functions:echo").unwrap().is_none());
    }

    #[tokio::test]
    async fn load_from_store_restores_table() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let catalog = FunctionCatalog::new(store.clone());
        catalog.store(&spec("echo", "http://fn.local")).unwrap();
        catalog.store(&spec("resize", "http://fn.local/r")).unwrap();

        let registry = FunctionRegistry::new(store);
        registry.load_from_store();
        assert_eq!(registry.stats().total_functions, 2);
        assert!(registry.get("echo").is_some());
    }

    #[tokio::test]
    async fn remove_unknown_is_not_found() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.remove("ghost"),
            Err(RelayError::FunctionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn stats_split_by_health() {
        let (registry, _) = registry();
        registry.register(spec("a", "http://fn.local/a")).unwrap();
        registry.register(spec("b", "http://fn.local/b")).unwrap();
        registry.set_active("b", false).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.total_functions, 2);
        assert_eq!(stats.active_functions, 1);
        assert_eq!(stats.inactive_functions, 1);
        assert_eq!(registry.active_functions().len(), 1);
    }

    #[tokio::test]
    async fn failed_probes_deactivate_and_recovery_reactivates() {
        let (registry, _) = registry();
        let healthy = Arc::new(AtomicBool::new(false));
        let endpoint = spawn_health_server(healthy.clone()).await;
        registry.register(spec("echo", &endpoint)).unwrap();

        let client = reqwest::Client::new();
        let timeout = Duration::from_secs(2);

        // Three consecutive failures leave it inactive
        for _ in 0..3 {
            let current = registry.get("echo").unwrap();
            probe_target(&registry, &client, &current, timeout).await;
        }
        assert!(!registry.get("echo").unwrap().is_active);

        // One success restores it
        healthy.store(true, Ordering::Relaxed);
        let current = registry.get("echo").unwrap();
        probe_target(&registry, &client, &current, timeout).await;
        assert!(registry.get("echo").unwrap().is_active);
    }

    #[tokio::test]
    async fn transport_failure_counts_as_unhealthy() {
        let (registry, _) = registry();
        // Nothing listens here
        registry.register(spec("echo", "http://127.0.0.1:9")).unwrap();

        let client = reqwest::Client::new();
        let current = registry.get("echo").unwrap();
        probe_target(&registry, &client, &current, Duration::from_millis(500)).await;
        assert!(!registry.get("echo").unwrap().is_active);
    }

    #[tokio::test]
    async fn probe_loop_flips_state_within_one_tick() {
        let (registry, _) = registry();
        let healthy = Arc::new(AtomicBool::new(false));
        let endpoint = spawn_health_server(healthy.clone()).await;
        registry.register(spec("echo", &endpoint)).unwrap();

        let cancel = CancellationToken::new();
        let handle = spawn_probe_task(
            Arc::clone(&registry),
            Duration::from_millis(30),
            Duration::from_secs(2),
            cancel.clone(),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while registry.get("echo").unwrap().is_active && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!registry.get("echo").unwrap().is_active);

        cancel.cancel();
        handle.await.unwrap();
    }
}
