use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{delete, get, post};
use axum::Router;
use relay_store::KeyValueStore;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::connections::{self, ConnectionRegistry};
use crate::dispatch::InvocationDispatcher;
use crate::functions::{self, FunctionRegistry};
use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    /// Capacity of each connection's outbound queue.
    pub queue_capacity: usize,
    /// Idle window after which a stream emits its own heartbeat.
    pub idle_timeout: Duration,
    /// Cadence of the registry-wide heartbeat broadcast.
    pub heartbeat_interval: Duration,
    /// Cadence of the stale-connection reaper.
    pub reaper_interval: Duration,
    /// Liveness age beyond which the reaper tears a connection down.
    pub stale_after: Duration,
    /// Cadence of the function health probes.
    pub probe_interval: Duration,
    /// Timeout for a single health probe.
    pub probe_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            queue_capacity: 100,
            idle_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(300),
            stale_after: Duration::from_secs(120),
            probe_interval: Duration::from_secs(120),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub connections: Arc<ConnectionRegistry>,
    pub functions: Arc<FunctionRegistry>,
    pub dispatcher: Arc<InvocationDispatcher>,
    pub store: Arc<dyn KeyValueStore>,
    pub idle_timeout: Duration,
    pub started_at: Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/sse/{client_id}", get(handlers::sse_connect))
        .route("/invoke/{function_name}", post(handlers::invoke_function))
        .route(
            "/admin/functions",
            post(handlers::register_function).get(handlers::list_functions),
        )
        .route("/admin/functions/{name}", delete(handlers::remove_function))
        .route("/admin/connections", get(handlers::list_connections))
        .route("/admin/health", get(handlers::health_check))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps the background
/// loops alive and drives teardown.
pub async fn start(
    config: ServerConfig,
    store: Arc<dyn KeyValueStore>,
) -> Result<ServerHandle, std::io::Error> {
    let connections = Arc::new(ConnectionRegistry::new(store.clone(), config.queue_capacity));
    let functions = Arc::new(FunctionRegistry::new(store.clone()));
    // Restore the catalogue before accepting any invocation traffic
    functions.load_from_store();

    let dispatcher = Arc::new(InvocationDispatcher::new(
        Arc::clone(&functions),
        Arc::clone(&connections),
    ));

    let cancel = CancellationToken::new();
    let heartbeat = connections::spawn_heartbeat_task(
        Arc::clone(&connections),
        config.heartbeat_interval,
        cancel.child_token(),
    );
    let reaper = connections::spawn_reaper_task(
        Arc::clone(&connections),
        config.reaper_interval,
        config.stale_after,
        cancel.child_token(),
    );
    let probes = functions::spawn_probe_task(
        Arc::clone(&functions),
        config.probe_interval,
        config.probe_timeout,
        cancel.child_token(),
    );

    let state = AppState {
        connections: Arc::clone(&connections),
        functions: Arc::clone(&functions),
        dispatcher,
        store,
        idle_timeout: config.idle_timeout,
        started_at: Instant::now(),
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    let local_addr = listener.local_addr()?;

    info!(port = local_addr.port(), "relay server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        connections,
        functions,
        cancel,
        server,
        _heartbeat: heartbeat,
        _reaper: reaper,
        _probes: probes,
    })
}

/// Handle returned by `start` — keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    connections: Arc<ConnectionRegistry>,
    functions: Arc<FunctionRegistry>,
    cancel: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    _heartbeat: tokio::task::JoinHandle<()>,
    _reaper: tokio::task::JoinHandle<()>,
    _probes: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop the background loops, close every connection, stop serving.
    /// Consumes the handle so teardown runs exactly once.
    pub fn shutdown(self) {
        info!("shutting down relay server");
        self.cancel.cancel();
        self.connections.shutdown();
        self.server.abort();
    }
}
