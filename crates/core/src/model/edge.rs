use serde::{Deserialize, Serialize};

/// Minute-bucketed caller→callee latency aggregate, appended to
/// `dependency_edges_minute`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DependencyEdgeRow {
    pub bucket_ts: String,
    pub env: String,
    pub caller_service: String,
    pub callee_service: String,
    pub caller_version: String,
    pub callee_version: String,
    pub calls: u64,
    pub error_calls: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: u32,
}
