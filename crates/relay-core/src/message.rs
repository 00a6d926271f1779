use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::ids::{ConnectionId, RequestId};

/// A single server-sent event, immutable once constructed.
///
/// Messages are queued per connection and encoded to the SSE wire format by
/// the stream that owns the socket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SseMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_ms: Option<u64>,
}

impl SseMessage {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: None,
            event: Some(event.into()),
            data,
            retry_ms: None,
        }
    }

    /// Greeting emitted once when a stream enters its streaming state.
    pub fn connected(connection_id: &ConnectionId, client_id: &str) -> Self {
        Self {
            id: Some(Uuid::now_v7().to_string()),
            event: Some("connected".into()),
            data: json!({
                "connection_id": connection_id.as_str(),
                "client_id": client_id,
                "timestamp": Utc::now().timestamp(),
                "message": "connected to relay",
            }),
            retry_ms: None,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new("heartbeat", json!({ "timestamp": Utc::now().timestamp() }))
    }

    /// Wraps an invocation result for delivery to a client's stream.
    pub fn function_response(request_id: &RequestId, payload: serde_json::Value) -> Self {
        Self {
            id: Some(request_id.to_string()),
            event: Some("function_response".into()),
            data: payload,
            retry_ms: None,
        }
    }

    /// Encode to the SSE wire format: optional `id:` and `event:` lines, one
    /// `data:` line with the JSON payload, optional `retry:` line, blank-line
    /// terminator.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        let data = serde_json::to_string(&self.data).unwrap_or_else(|_| "null".into());
        out.push_str("data: ");
        out.push_str(&data);
        out.push('\n');
        if let Some(retry) = self.retry_ms {
            out.push_str(&format!("retry: {retry}\n"));
        }
        out.push('\n');
        out
    }
}
