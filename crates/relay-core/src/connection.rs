use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ConnectionId;

/// Serializable snapshot of a live connection, used for persistence and the
/// admin surface. The in-memory connection itself (with its queue) lives in
/// the registry and is never serialized.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub active: bool,
}

/// Registry-wide counters, broadcast as a metric and exposed to admins.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub unique_clients: usize,
    pub uptime_seconds: u64,
    pub clients_breakdown: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_roundtrip() {
        let info = ConnectionInfo {
            id: ConnectionId::from_raw("conn_1"),
            client_id: "g1".into(),
            user_id: Some("u1".into()),
            metadata: HashMap::from([("tab".to_string(), "2".to_string())]),
            created_at: Utc::now(),
            last_seen: Utc::now(),
            active: true,
        };
        let json = serde_json::to_string(&info).unwrap();
        let parsed: ConnectionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, info.id);
        assert_eq!(parsed.metadata["tab"], "2");
        assert!(parsed.active);
    }

    #[test]
    fn info_omits_absent_user() {
        let info = ConnectionInfo {
            id: ConnectionId::from_raw("conn_2"),
            client_id: "g1".into(),
            user_id: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
            last_seen: Utc::now(),
            active: true,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("user_id"));
    }

    #[test]
    fn stats_serialize_breakdown() {
        let stats = ConnectionStats {
            total_connections: 3,
            unique_clients: 2,
            uptime_seconds: 60,
            clients_breakdown: HashMap::from([("g1".to_string(), 2), ("g2".to_string(), 1)]),
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["total_connections"], 3);
        assert_eq!(json["clients_breakdown"]["g1"], 2);
    }
}
