use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracelite_core::model::RawLogRow;
use tracelite_core::time::format_ch_time;

pub fn base_ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
}

/// Builder for normalized raw-log rows, pre-filled with the defaults the
/// normalizer would produce. `ts` is mirrored into the row text.
pub struct RawEventBuilder {
    row: RawLogRow,
    ts: DateTime<Utc>,
}

pub fn raw_event(trace_id: &str, span_id: &str) -> RawEventBuilder {
    let ts = base_ts();
    RawEventBuilder {
        row: RawLogRow {
            ts: format_ch_time(ts),
            ingest_ts: format_ch_time(ts),
            service: "svc-a".to_string(),
            env: "prod".to_string(),
            host: "host-1".to_string(),
            version: "1.0.0".to_string(),
            level: "INFO".to_string(),
            message: String::new(),
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            parent_span_id: String::new(),
            event: "log".to_string(),
            route: String::new(),
            method: String::new(),
            status_code: 0,
            duration_ms: 0,
            attrs: BTreeMap::new(),
            raw_json: "{}".to_string(),
        },
        ts,
    }
}

impl RawEventBuilder {
    pub fn offset_ms(mut self, ms: i64) -> Self {
        self.ts = base_ts() + Duration::milliseconds(ms);
        self.row.ts = format_ch_time(self.ts);
        self
    }

    pub fn event_type(mut self, event: &str) -> Self {
        self.row.event = event.to_string();
        self
    }

    pub fn parent(mut self, parent_span_id: &str) -> Self {
        self.row.parent_span_id = parent_span_id.to_string();
        self
    }

    pub fn service(mut self, service: &str) -> Self {
        self.row.service = service.to_string();
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.row.version = version.to_string();
        self
    }

    pub fn host(mut self, host: &str) -> Self {
        self.row.host = host.to_string();
        self
    }

    pub fn route(mut self, route: &str) -> Self {
        self.row.route = route.to_string();
        self
    }

    pub fn message(mut self, message: &str) -> Self {
        self.row.message = message.to_string();
        self
    }

    pub fn status_code(mut self, status_code: u16) -> Self {
        self.row.status_code = status_code;
        self
    }

    pub fn duration_ms(mut self, duration_ms: u32) -> Self {
        self.row.duration_ms = duration_ms;
        self
    }

    pub fn build(self) -> (RawLogRow, DateTime<Utc>) {
        (self.row, self.ts)
    }
}

/// The canonical two-service trace as the agent would ship it: NDJSON with a
/// root span on `svc-a` and a nested call into `svc-b`.
pub fn sample_trace_ndjson(trace_id: &str) -> String {
    let t0 = base_ts();
    let lines = vec![
        serde_json::json!({
            "timestamp": t0.to_rfc3339(),
            "service": "svc-a", "env": "prod", "host": "host-1", "version": "1.0.0",
            "correlationId": trace_id, "spanId": "s1", "event": "start", "route": "/checkout",
        }),
        serde_json::json!({
            "timestamp": (t0 + Duration::milliseconds(100)).to_rfc3339(),
            "service": "svc-a", "env": "prod", "host": "host-1", "version": "1.0.0",
            "correlationId": trace_id, "spanId": "s1", "event": "end", "durationMs": 100,
        }),
        serde_json::json!({
            "timestamp": (t0 + Duration::milliseconds(20)).to_rfc3339(),
            "service": "svc-b", "env": "prod", "host": "host-2", "version": "2.1.0",
            "correlationId": trace_id, "spanId": "s2", "parentSpanId": "s1", "event": "start",
        }),
        serde_json::json!({
            "timestamp": (t0 + Duration::milliseconds(80)).to_rfc3339(),
            "service": "svc-b", "env": "prod", "host": "host-2", "version": "2.1.0",
            "correlationId": trace_id, "spanId": "s2", "event": "end", "durationMs": 60,
        }),
    ];
    lines
        .into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}
