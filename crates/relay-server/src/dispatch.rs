//! Invocation dispatcher: resolves a target, gates on its availability,
//! performs the outbound call, and routes the result back — synchronously
//! to the caller and, when a client id is supplied, as a
//! `function_response` message to that client's streams.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use relay_core::{InvocationRequest, InvocationResponse, RelayError, RequestId, SseMessage};
use tracing::{info, warn};

use crate::connections::ConnectionRegistry;
use crate::functions::FunctionRegistry;

/// One outbound call to a backend function, as handed to the transport.
#[derive(Clone, Debug)]
pub struct OutboundCall {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
    pub timeout: Duration,
}

/// What the backend answered with.
#[derive(Clone, Debug)]
pub struct OutboundResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

/// Transport seam for reaching backend functions.
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(&self, call: OutboundCall) -> Result<OutboundResponse, RelayError>;
}

/// Production transport backed by reqwest.
pub struct HttpInvoker {
    client: reqwest::Client,
}

impl HttpInvoker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FunctionInvoker for HttpInvoker {
    async fn invoke(&self, call: OutboundCall) -> Result<OutboundResponse, RelayError> {
        let method = reqwest::Method::from_bytes(call.method.as_bytes())
            .map_err(|e| RelayError::InvalidInput(format!("invalid method {}: {e}", call.method)))?;

        let mut request = self
            .client
            .request(method, &call.url)
            .timeout(call.timeout)
            .json(&call.body);
        for (key, value) in &call.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| RelayError::Transport(format!("function invocation failed: {e}")))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| RelayError::Transport(format!("failed to read response: {e}")))?;

        Ok(OutboundResponse {
            status,
            content_type,
            body,
        })
    }
}

pub struct InvocationDispatcher {
    functions: Arc<FunctionRegistry>,
    connections: Arc<ConnectionRegistry>,
    invoker: Arc<dyn FunctionInvoker>,
}

impl InvocationDispatcher {
    pub fn new(functions: Arc<FunctionRegistry>, connections: Arc<ConnectionRegistry>) -> Self {
        Self::with_invoker(functions, connections, Arc::new(HttpInvoker::new()))
    }

    pub fn with_invoker(
        functions: Arc<FunctionRegistry>,
        connections: Arc<ConnectionRegistry>,
        invoker: Arc<dyn FunctionInvoker>,
    ) -> Self {
        Self {
            functions,
            connections,
            invoker,
        }
    }

    /// Run one invocation end to end. Unknown or inactive targets are
    /// errors and never reach the transport; a transport failure surfaces
    /// inside the response instead, and never flips the target's health —
    /// only the probe loop does that.
    pub async fn dispatch(
        &self,
        name: &str,
        request: InvocationRequest,
    ) -> Result<InvocationResponse, RelayError> {
        let spec = self
            .functions
            .get(name)
            .ok_or_else(|| RelayError::FunctionNotFound(name.to_string()))?;
        if !spec.is_active {
            return Err(RelayError::FunctionUnavailable(name.to_string()));
        }

        let request_id = RequestId::new();
        let started = Instant::now();

        let timeout = Duration::from_secs(request.timeout_secs.unwrap_or(spec.timeout_secs));
        let mut headers = vec![("X-Request-ID".to_string(), request_id.to_string())];
        if let Some(client_id) = &request.client_id {
            headers.push(("X-Client-ID".to_string(), client_id.clone()));
        }
        headers.extend(spec.headers.iter().map(|(k, v)| (k.clone(), v.clone())));

        let call = OutboundCall {
            method: spec.method.clone(),
            url: spec.endpoint.clone(),
            headers,
            body: request.payload.clone(),
            timeout,
        };

        let mut response = match self.invoker.invoke(call).await {
            Ok(outbound) => interpret_response(outbound, &request_id),
            Err(err) => {
                warn!(function = %name, request_id = %request_id, error = %err, "invocation failed");
                InvocationResponse {
                    success: false,
                    data: None,
                    error: Some(err.to_string()),
                    duration_ms: 0,
                    request_id: request_id.clone(),
                }
            }
        };
        response.duration_ms = started.elapsed().as_millis() as i64;

        if let Some(client_id) = &request.client_id {
            self.deliver(client_id, &request_id, &response);
        }

        info!(
            function = %name,
            request_id = %request_id,
            success = response.success,
            duration_ms = response.duration_ms,
            "invocation complete"
        );
        Ok(response)
    }

    /// Fan the result out to the client's streams. Delivery failures are
    /// logged, never escalated — the synchronous return already happened
    /// or is about to, independently.
    fn deliver(&self, client_id: &str, request_id: &RequestId, response: &InvocationResponse) {
        match serde_json::to_value(response) {
            Ok(payload) => {
                let message = SseMessage::function_response(request_id, payload);
                self.connections.broadcast_to_client(client_id, &message);
            }
            Err(err) => {
                warn!(request_id = %request_id, error = %err, "failed to serialize invocation response");
            }
        }
    }
}

/// Decode the backend's answer: JSON content types become structured data
/// (falling back to the raw text if decoding fails), everything else is an
/// opaque string. Success is the 2xx range.
fn interpret_response(outbound: OutboundResponse, request_id: &RequestId) -> InvocationResponse {
    let data = if outbound.content_type.contains("application/json") {
        match serde_json::from_str(&outbound.body) {
            Ok(value) => value,
            Err(_) => serde_json::Value::String(outbound.body),
        }
    } else {
        serde_json::Value::String(outbound.body)
    };

    InvocationResponse {
        success: (200..300).contains(&outbound.status),
        data: Some(data),
        error: None,
        duration_ms: 0,
        request_id: request_id.clone(),
    }
}
