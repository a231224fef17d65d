use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One ingested event, exactly as persisted into `raw_logs`.
/// Timestamps are ClickHouse DateTime64(3) literals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawLogRow {
    pub ts: String,
    pub ingest_ts: String,
    pub service: String,
    pub env: String,
    pub host: String,
    pub version: String,
    pub level: String,
    pub message: String,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: String,
    pub event: String,
    pub route: String,
    pub method: String,
    pub status_code: u16,
    pub duration_ms: u32,
    pub attrs: BTreeMap<String, String>,
    pub raw_json: String,
}
