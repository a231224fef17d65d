use serde::{Deserialize, Serialize};

pub const SOURCE_EXPLICIT: &str = "explicit";
pub const SOURCE_INFERRED: &str = "inferred";

/// Canonical reconstructed span, upserted into `spans` on
/// `(env, service, start_ts, trace_id, span_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpanRow {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: String,
    pub service: String,
    pub env: String,
    pub host: String,
    pub version: String,
    pub operation: String,
    pub start_ts: String,
    pub end_ts: String,
    pub duration_ms: u32,
    pub self_time_ms: u32,
    pub status_code: u16,
    pub is_error: u8,
    pub source: String,
}
