use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{Result, TraceLiteError};
use crate::model::RawLogRow;
use crate::time::{format_ch_time, parse_rfc3339};

/// One event as the agent ships it. Every field except `correlationId` is
/// optional on the wire; normalization fills the gaps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IngestEvent {
    pub timestamp: String,
    pub service: String,
    pub env: String,
    pub host: String,
    pub level: String,
    pub message: String,
    pub status: String,
    pub correlation_id: String,
    pub span_id: String,
    pub parent_span_id: String,
    pub event: String,
    pub route: String,
    pub method: String,
    pub status_code: u16,
    pub duration_ms: u32,
    pub version: String,
    pub attrs: BTreeMap<String, String>,
}

impl IngestEvent {
    /// Normalizes into a `raw_logs` row plus the event time used by the
    /// reconstructor. `received_at` stands in when no timestamp was sent.
    ///
    /// Fatal only when `correlationId` is missing or a timestamp is present
    /// but unparseable; everything else defaults.
    pub fn to_raw(&self, raw: &str, received_at: DateTime<Utc>) -> Result<(RawLogRow, DateTime<Utc>)> {
        let trace_id = self.correlation_id.trim();
        if trace_id.is_empty() {
            return Err(TraceLiteError::Validation("missing correlationId".to_string()));
        }

        let ts = if self.timestamp.trim().is_empty() {
            received_at
        } else {
            parse_rfc3339(self.timestamp.trim())
                .map_err(|e| TraceLiteError::Validation(e.to_string()))?
        };

        let mut event = self.event.trim().to_lowercase();
        if event.is_empty() {
            event = "log".to_string();
        }

        let mut attrs = self.attrs.clone();
        let status = self.status.trim();
        if !status.is_empty() {
            attrs.insert("status".to_string(), status.to_uppercase());
        }

        let row = RawLogRow {
            ts: format_ch_time(ts),
            ingest_ts: format_ch_time(received_at),
            service: with_default(&self.service, "unknown-service"),
            env: with_default(&self.env, "unknown"),
            host: with_default(&self.host, "unknown-host"),
            version: with_default(&self.version, "unknown"),
            level: with_default(&self.level, "INFO").to_uppercase(),
            message: self.message.clone(),
            trace_id: trace_id.to_string(),
            span_id: self.span_id.trim().to_string(),
            parent_span_id: self.parent_span_id.trim().to_string(),
            event,
            route: self.route.clone(),
            method: self.method.to_uppercase(),
            status_code: self.status_code,
            duration_ms: self.duration_ms,
            attrs,
            raw_json: raw.to_string(),
        };
        Ok((row, ts))
    }
}

fn with_default(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}
