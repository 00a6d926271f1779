use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::RequestId;

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// A registered backend function target. `name` is the sole identity;
/// re-registering under the same name overwrites the previous entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_timeout", rename = "timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// Body of a `POST /invoke/{name}` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvocationRequest {
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, rename = "async")]
    pub async_delivery: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "timeout")]
    pub timeout_secs: Option<u64>,
}

impl Default for InvocationRequest {
    fn default() -> Self {
        Self {
            payload: serde_json::Value::Null,
            client_id: None,
            async_delivery: false,
            timeout_secs: None,
        }
    }
}

/// Outcome of one invocation. Produced exactly once; returned to the caller
/// and, when a client id was supplied, also fanned out to that client's
/// streams as a `function_response` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: i64,
    pub request_id: RequestId,
}

/// Function registry counters for the admin surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionStats {
    pub total_functions: usize,
    pub active_functions: usize,
    pub inactive_functions: usize,
}
