use serde::{Deserialize, Serialize};

/// Per-trace rollup, upserted into `traces` on `(env, start_ts, trace_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceRow {
    pub trace_id: String,
    pub env: String,
    pub root_service: String,
    pub start_ts: String,
    pub end_ts: String,
    pub duration_ms: u32,
    pub span_count: u16,
    pub service_count: u16,
    pub error_count: u16,
    pub critical_path_ms: u32,
    pub versions: Vec<String>,
}
