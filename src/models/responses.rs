//! Response DTOs for the dashboard API
//!
//! Defines the structure of outgoing HTTP response bodies.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::cache::CacheStats;
use crate::health::ConnectionState;
use crate::kind::{CollectionKind, TenantId};

/// Response body for a collection read (GET /tenants/:tenant/:kind)
#[derive(Debug, Clone, Serialize)]
pub struct ListResponse {
    pub tenant: TenantId,
    pub kind: CollectionKind,
    pub count: usize,
    /// Items in the kind's order
    pub items: Vec<Value>,
}

impl ListResponse {
    pub fn new(tenant: TenantId, kind: CollectionKind, items: Vec<Value>) -> Self {
        Self {
            tenant,
            kind,
            count: items.len(),
            items,
        }
    }
}

/// Response body for DELETE /tenants/:tenant/:kind/:id
#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    /// Success message
    pub message: String,
    /// The id that was deleted
    pub id: String,
    /// Last server-side representation of the item
    pub item: Value,
}

impl DeleteResponse {
    pub fn new(id: impl Into<String>, item: Value) -> Self {
        let id = id.into();
        Self {
            message: format!("Item '{}' deleted successfully", id),
            id,
            item,
        }
    }
}

/// Response body for cache maintenance endpoints
#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Response body for the stats endpoint (GET /stats)
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// Counters summed over every kind
    pub total: CacheStats,
    /// Fresh reads / all reads
    pub hit_rate: f64,
    pub collections: BTreeMap<String, CacheStats>,
}

impl StatsResponse {
    /// Creates a new StatsResponse from per-kind statistics
    pub fn new(per_kind: Vec<(CollectionKind, CacheStats)>) -> Self {
        let mut total = CacheStats::new();
        let mut collections = BTreeMap::new();
        for (kind, stats) in per_kind {
            total.merge(&stats);
            collections.insert(kind.to_string(), stats);
        }
        Self {
            hit_rate: total.hit_rate(),
            total,
            collections,
        }
    }
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// "healthy", "degraded" or "corrupted"
    pub status: String,
    pub connection: ConnectionState,
    /// True once the client must be reset
    pub reset_required: bool,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn from_state(connection: ConnectionState) -> Self {
        Self {
            status: connection.label().to_string(),
            connection,
            reset_required: connection == ConnectionState::Corrupted,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Error response body for all error conditions
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong
    pub error: String,
    /// True when the client must be reset before retrying
    pub reset_required: bool,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, reset_required: bool) -> Self {
        Self {
            error: error.into(),
            reset_required,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_list_response_counts_items() {
        let resp = ListResponse::new(
            TenantId::new("r1"),
            CollectionKind::MenuItems,
            vec![json!({"id": "a"}), json!({"id": "b"})],
        );
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["count"], 2);
        assert_eq!(json["kind"], "menu_items");
        assert_eq!(json["tenant"], "r1");
    }

    #[test]
    fn test_delete_response_serialize() {
        let resp = DeleteResponse::new("t1", json!({"id": "t1"}));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("t1"));
        assert!(json.contains("deleted"));
    }

    #[test]
    fn test_stats_response_hit_rate() {
        let tables = CacheStats {
            hits: 3,
            misses: 1,
            ..CacheStats::default()
        };
        let staff = CacheStats {
            hits: 1,
            stale: 3,
            ..CacheStats::default()
        };
        let resp = StatsResponse::new(vec![
            (CollectionKind::Tables, tables),
            (CollectionKind::Staff, staff),
        ]);
        assert_eq!(resp.total.hits, 4);
        assert!((resp.hit_rate - 0.5).abs() < 0.001);
        assert!(resp.collections.contains_key("tables"));
    }

    #[test]
    fn test_stats_response_zero_requests() {
        let resp = StatsResponse::new(Vec::new());
        assert_eq!(resp.hit_rate, 0.0);
    }

    #[test]
    fn test_health_response_serialize() {
        let resp = HealthResponse::from_state(ConnectionState::Degraded(2));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["connection"]["retry_count"], 2);
        assert_eq!(json["reset_required"], false);
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_health_response_corrupted_requires_reset() {
        let resp = HealthResponse::from_state(ConnectionState::Corrupted);
        assert!(resp.reset_required);
        assert_eq!(resp.status, "corrupted");
    }

    #[test]
    fn test_error_response_serialize() {
        let resp = ErrorResponse::new("Something went wrong", false);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("error"));
        assert!(json.contains("Something went wrong"));
    }
}
