//! HTTP handlers for the stream, invocation, and admin surfaces.

use std::collections::HashMap;
use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures::stream::Stream;
use relay_core::{FunctionSpec, InvocationRequest, InvocationResponse, RelayError};
use serde::Serialize;
use serde_json::json;

use crate::server::AppState;
use crate::stream::connection_stream;

/// Structured error body carrying the status mapping of the error taxonomy.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let status = match &err {
            RelayError::ConnectionNotFound(_) | RelayError::FunctionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            RelayError::FunctionUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RelayError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
            RelayError::Transport(_) | RelayError::Persistence(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// `GET /sse/{client_id}` — open a stream. Query parameters become
/// connection metadata; an `X-User-ID` header attributes the connection.
pub async fn sse_connect(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .map(String::from);

    let (conn, rx) = state.connections.open(client_id, user_id, params);
    let stream = connection_stream(
        state.connections.clone(),
        conn.id.clone(),
        conn.client_id.clone(),
        rx,
        state.idle_timeout,
    );
    Sse::new(stream)
}

/// `POST /invoke/{function_name}` — run one invocation. The response body
/// is always the invocation result; transport failures are carried inside
/// it, while unknown/inactive targets map to 404/503.
pub async fn invoke_function(
    State(state): State<AppState>,
    Path(function_name): Path<String>,
    Json(request): Json<InvocationRequest>,
) -> Result<Json<InvocationResponse>, ApiError> {
    let response = state.dispatcher.dispatch(&function_name, request).await?;
    Ok(Json(response))
}

/// `POST /admin/functions` — register (or overwrite) a function target.
pub async fn register_function(
    State(state): State<AppState>,
    Json(spec): Json<FunctionSpec>,
) -> Result<Json<FunctionSpec>, ApiError> {
    let stored = state.functions.register(spec)?;
    Ok(Json(stored))
}

/// `GET /admin/functions`
pub async fn list_functions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let functions = state.functions.all_functions();
    let count = functions.len();
    Json(json!({ "functions": functions, "count": count }))
}

/// `DELETE /admin/functions/{name}`
pub async fn remove_function(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.functions.remove(&name)?;
    Ok(Json(json!({ "removed": name })))
}

/// `GET /admin/connections`
pub async fn list_connections(State(state): State<AppState>) -> Json<serde_json::Value> {
    let connections: Vec<_> = state
        .connections
        .all_connections()
        .iter()
        .map(|conn| conn.info())
        .collect();
    let stats = state.connections.stats();
    Json(json!({
        "connections": connections,
        "stats": stats,
        "timestamp": Utc::now().timestamp(),
    }))
}

#[derive(Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub active_connections: usize,
    pub registered_functions: usize,
    pub store_connected: bool,
    pub uptime_seconds: u64,
    pub metrics: serde_json::Value,
}

/// `GET /admin/health`
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let connection_stats = state.connections.stats();
    let function_stats = state.functions.stats();
    let store_connected = state.store.ping().is_ok();

    let health = HealthStatus {
        status: if store_connected { "healthy" } else { "degraded" },
        active_connections: connection_stats.total_connections,
        registered_functions: function_stats.total_functions,
        store_connected,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        metrics: json!({
            "connections": connection_stats,
            "functions": function_stats,
        }),
    };

    let code = if store_connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(health))
}
