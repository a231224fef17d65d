use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

use tracelite_core::error::Result;
use tracelite_core::model::span::{SOURCE_EXPLICIT, SOURCE_INFERRED};
use tracelite_core::model::{DependencyEdgeRow, RawLogRow, SpanRow, TraceRow};
use tracelite_core::time::{format_ch_minute, format_ch_time};
use tracelite_store::Store;

/// Windowed in-memory trace assembler. Events fold into per-trace span
/// accumulators; traces idle for `window` are finalized and written out as
/// span, trace, and dependency-edge rows on the next flush tick.
pub struct Reconstructor {
    traces: Mutex<HashMap<String, TraceState>>,
    window: chrono::Duration,
    flush_interval: Duration,
    store: Store,
}

#[derive(Debug, Clone)]
struct TraceState {
    env: String,
    updated_at: DateTime<Utc>,
    spans: HashMap<String, SpanState>,
}

#[derive(Debug, Clone)]
struct SpanState {
    trace_id: String,
    span_id: String,
    parent_span_id: String,
    service: String,
    env: String,
    host: String,
    version: String,
    operation: String,
    start_ts: Option<DateTime<Utc>>,
    end_ts: Option<DateTime<Utc>>,
    duration_ms: u32,
    status_code: u16,
    is_error: bool,
}

#[derive(Debug, Default)]
struct FlushBatch {
    trace_ids: Vec<String>,
    spans: Vec<SpanRow>,
    traces: Vec<TraceRow>,
    edges: Vec<DependencyEdgeRow>,
}

struct FinalSpan {
    row: SpanRow,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Reconstructor {
    pub fn new(store: Store, window: Duration, flush_interval: Duration) -> Self {
        Self {
            traces: Mutex::new(HashMap::new()),
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX),
            flush_interval,
            store,
        }
    }

    /// Folds a batch of normalized events into the trace map. `times` carries
    /// the parsed event timestamps, index-aligned with `rows`.
    pub async fn add(&self, rows: &[RawLogRow], times: &[DateTime<Utc>]) {
        let mut traces = self.traces.lock().await;
        for (row, ts) in rows.iter().zip(times.iter().copied()) {
            fold_event(&mut traces, row, ts);
        }
    }

    pub async fn resident_traces(&self) -> usize {
        self.traces.lock().await.len()
    }

    /// Periodic flush loop; exits when the shutdown signal fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush_now().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Finalizes and writes every trace idle for at least `window`. On a
    /// store failure nothing is deleted, so the whole batch retries on the
    /// next tick; spans and traces upsert on their natural keys.
    pub async fn flush_now(&self) {
        let now = Utc::now();
        let mut traces = self.traces.lock().await;
        let batch = build_flush_batch(&traces, self.window, now);
        if batch.trace_ids.is_empty() {
            return;
        }

        if let Err(e) = self.write_batch(&batch).await {
            warn!(error = %e, traces = batch.trace_ids.len(), "flush failed, keeping traces in memory");
            return;
        }

        for trace_id in &batch.trace_ids {
            traces.remove(trace_id);
        }
        debug!(
            traces = batch.trace_ids.len(),
            spans = batch.spans.len(),
            edges = batch.edges.len(),
            "flushed aged traces"
        );
    }

    async fn write_batch(&self, batch: &FlushBatch) -> Result<()> {
        self.store.insert_json_each_row("spans", &batch.spans).await?;
        self.store.insert_json_each_row("traces", &batch.traces).await?;
        self.store
            .insert_json_each_row("dependency_edges_minute", &batch.edges)
            .await?;
        Ok(())
    }
}

fn fold_event(traces: &mut HashMap<String, TraceState>, row: &RawLogRow, ts: DateTime<Utc>) {
    let state = traces.entry(row.trace_id.clone()).or_insert_with(|| TraceState {
        env: row.env.clone(),
        updated_at: ts,
        spans: HashMap::new(),
    });
    if ts > state.updated_at {
        state.updated_at = ts;
    }

    let span_id = if row.span_id.is_empty() {
        format!("implicit-{}", format_ch_time(ts))
    } else {
        row.span_id.clone()
    };
    let span = state.spans.entry(span_id.clone()).or_insert_with(|| SpanState {
        trace_id: row.trace_id.clone(),
        span_id,
        parent_span_id: row.parent_span_id.clone(),
        service: row.service.clone(),
        env: row.env.clone(),
        host: row.host.clone(),
        version: row.version.clone(),
        operation: choose_operation(&row.route, &row.message),
        start_ts: None,
        end_ts: None,
        duration_ms: 0,
        status_code: 0,
        is_error: false,
    });

    if !row.parent_span_id.is_empty() {
        span.parent_span_id = row.parent_span_id.clone();
    }
    if span.service.is_empty() {
        span.service = row.service.clone();
    }
    if span.version.is_empty() {
        span.version = row.version.clone();
    }
    if span.host.is_empty() {
        span.host = row.host.clone();
    }
    if span.operation.is_empty() {
        span.operation = choose_operation(&row.route, &row.message);
    }
    if row.status_code >= 400 {
        span.is_error = true;
    }
    if row.status_code > 0 {
        span.status_code = row.status_code;
    }

    match row.event.as_str() {
        "start" => {
            span.start_ts = Some(span.start_ts.map_or(ts, |cur| cur.min(ts)));
        }
        "end" => {
            span.end_ts = Some(span.end_ts.map_or(ts, |cur| cur.max(ts)));
            if row.duration_ms > 0 {
                span.duration_ms = row.duration_ms;
            }
        }
        _ => {
            if row.duration_ms > 0 {
                span.end_ts = Some(span.end_ts.map_or(ts, |cur| cur.max(ts)));
                let candidate = ts - chrono::Duration::milliseconds(i64::from(row.duration_ms));
                span.start_ts = Some(span.start_ts.map_or(candidate, |cur| cur.min(candidate)));
                span.duration_ms = row.duration_ms;
            }
        }
    }
}

fn choose_operation(route: &str, fallback: &str) -> String {
    if !route.is_empty() {
        route.to_string()
    } else if !fallback.is_empty() {
        fallback.to_string()
    } else {
        "unknown-op".to_string()
    }
}

fn build_flush_batch(
    traces: &HashMap<String, TraceState>,
    window: chrono::Duration,
    now: DateTime<Utc>,
) -> FlushBatch {
    let mut aged: Vec<(&String, &TraceState)> = traces
        .iter()
        .filter(|(_, state)| now.signed_duration_since(state.updated_at) >= window)
        .collect();
    aged.sort_by(|a, b| a.0.cmp(b.0));

    let mut batch = FlushBatch::default();
    let mut edge_agg: BTreeMap<EdgeKey, EdgeAcc> = BTreeMap::new();
    for (trace_id, state) in aged {
        let finals = finalize_spans(state, now);
        if !finals.is_empty() {
            batch.traces.push(build_trace_row(&state.env, trace_id, &finals));
            accumulate_edges(&finals, &mut edge_agg);
            batch.spans.extend(finals.into_iter().map(|f| f.row));
        }
        batch.trace_ids.push(trace_id.clone());
    }
    batch.edges = collapse_edges(edge_agg);
    batch
}

/// Resolves each span's boundaries, then computes self-time against the
/// resolved child durations. Two passes keep the result independent of map
/// iteration order.
fn finalize_spans(state: &TraceState, now: DateTime<Utc>) -> Vec<FinalSpan> {
    let ms = |v: u32| chrono::Duration::milliseconds(i64::from(v));

    let mut resolved: HashMap<&str, (DateTime<Utc>, DateTime<Utc>, u32, &'static str)> =
        HashMap::with_capacity(state.spans.len());
    for span in state.spans.values() {
        let (start, mut end, source) = match (span.start_ts, span.end_ts) {
            (Some(start), Some(end)) => (start, end, SOURCE_EXPLICIT),
            (Some(start), None) if span.duration_ms > 0 => {
                (start, start + ms(span.duration_ms), SOURCE_INFERRED)
            }
            (Some(start), None) => (start, start, SOURCE_INFERRED),
            (None, Some(end)) if span.duration_ms > 0 => {
                (end - ms(span.duration_ms), end, SOURCE_INFERRED)
            }
            (None, _) => (now, now, SOURCE_INFERRED),
        };
        if end < start {
            end = start;
        }
        let duration = if span.duration_ms > 0 {
            span.duration_ms
        } else {
            end.signed_duration_since(start).num_milliseconds().max(0) as u32
        };
        resolved.insert(span.span_id.as_str(), (start, end, duration, source));
    }

    let mut child_totals: HashMap<&str, u64> = HashMap::new();
    for span in state.spans.values() {
        if span.parent_span_id.is_empty() {
            continue;
        }
        if let Some(&(_, _, duration, _)) = resolved.get(span.span_id.as_str()) {
            *child_totals.entry(span.parent_span_id.as_str()).or_default() +=
                u64::from(duration);
        }
    }

    let mut out: Vec<FinalSpan> = Vec::with_capacity(state.spans.len());
    for span in state.spans.values() {
        let Some(&(start, end, duration, source)) = resolved.get(span.span_id.as_str()) else {
            continue;
        };
        let child_total = child_totals.get(span.span_id.as_str()).copied().unwrap_or(0);
        let self_time = if child_total < u64::from(duration) {
            duration - child_total as u32
        } else {
            duration
        };
        out.push(FinalSpan {
            row: SpanRow {
                trace_id: span.trace_id.clone(),
                span_id: span.span_id.clone(),
                parent_span_id: span.parent_span_id.clone(),
                service: span.service.clone(),
                env: span.env.clone(),
                host: span.host.clone(),
                version: span.version.clone(),
                operation: span.operation.clone(),
                start_ts: format_ch_time(start),
                end_ts: format_ch_time(end),
                duration_ms: duration,
                self_time_ms: self_time,
                status_code: span.status_code,
                is_error: u8::from(span.is_error),
                source: source.to_string(),
            },
            start,
            end,
        });
    }
    out.sort_by(|a, b| (a.start, &a.row.span_id).cmp(&(b.start, &b.row.span_id)));
    out
}

fn build_trace_row(env: &str, trace_id: &str, finals: &[FinalSpan]) -> TraceRow {
    let mut start = finals[0].start;
    let mut end = finals[0].end;
    let mut root_service = finals[0].row.service.clone();
    let mut services: HashSet<&str> = HashSet::new();
    let mut versions: BTreeSet<&str> = BTreeSet::new();
    let mut error_count = 0u16;
    for f in finals {
        if f.start < start {
            start = f.start;
            root_service = f.row.service.clone();
        }
        if f.end > end {
            end = f.end;
        }
        services.insert(f.row.service.as_str());
        versions.insert(f.row.version.as_str());
        if f.row.is_error == 1 {
            error_count = error_count.saturating_add(1);
        }
    }

    TraceRow {
        trace_id: trace_id.to_string(),
        env: env.to_string(),
        root_service,
        start_ts: format_ch_time(start),
        end_ts: format_ch_time(end),
        duration_ms: end.signed_duration_since(start).num_milliseconds().max(0) as u32,
        span_count: finals.len() as u16,
        service_count: services.len() as u16,
        error_count,
        critical_path_ms: critical_path(finals),
        versions: versions.into_iter().map(str::to_string).collect(),
    }
}

/// Longest root-to-leaf duration sum over the parent→children DAG, memoized,
/// with a visiting set so parent-id cycles terminate. Seeds are spans whose
/// parent is absent from the trace; a fully cyclic trace seeds from all.
fn critical_path(finals: &[FinalSpan]) -> u32 {
    let mut durations: HashMap<&str, u32> = HashMap::with_capacity(finals.len());
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for f in finals {
        durations.insert(f.row.span_id.as_str(), f.row.duration_ms);
        if !f.row.parent_span_id.is_empty() {
            children
                .entry(f.row.parent_span_id.as_str())
                .or_default()
                .push(f.row.span_id.as_str());
        }
    }

    fn dfs<'a>(
        id: &'a str,
        durations: &HashMap<&'a str, u32>,
        children: &HashMap<&'a str, Vec<&'a str>>,
        memo: &mut HashMap<&'a str, u32>,
        visiting: &mut HashSet<&'a str>,
    ) -> u32 {
        if let Some(&score) = memo.get(id) {
            return score;
        }
        if !visiting.insert(id) {
            return 0;
        }
        let mut best_child = 0;
        if let Some(kids) = children.get(id) {
            for &child in kids {
                best_child = best_child.max(dfs(child, durations, children, memo, visiting));
            }
        }
        visiting.remove(id);
        let total = durations.get(id).copied().unwrap_or(0).saturating_add(best_child);
        memo.insert(id, total);
        total
    }

    let mut memo = HashMap::new();
    let mut visiting = HashSet::new();
    let mut best = 0;
    for f in finals {
        let parent = f.row.parent_span_id.as_str();
        if !parent.is_empty() && durations.contains_key(parent) {
            continue;
        }
        best = best.max(dfs(
            f.row.span_id.as_str(),
            &durations,
            &children,
            &mut memo,
            &mut visiting,
        ));
    }
    if best == 0 {
        for f in finals {
            best = best.max(dfs(
                f.row.span_id.as_str(),
                &durations,
                &children,
                &mut memo,
                &mut visiting,
            ));
        }
    }
    best
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct EdgeKey {
    bucket: String,
    env: String,
    caller_service: String,
    callee_service: String,
    caller_version: String,
    callee_version: String,
}

#[derive(Debug, Default)]
struct EdgeAcc {
    durations: Vec<u32>,
    error_calls: u64,
}

/// One call per parent→child pair whose services differ, bucketed on the
/// minute of the callee's start. Durations and errors are the callee's.
fn accumulate_edges(finals: &[FinalSpan], agg: &mut BTreeMap<EdgeKey, EdgeAcc>) {
    let by_id: HashMap<&str, &FinalSpan> = finals
        .iter()
        .map(|f| (f.row.span_id.as_str(), f))
        .collect();

    for f in finals {
        if f.row.parent_span_id.is_empty() {
            continue;
        }
        let Some(parent) = by_id.get(f.row.parent_span_id.as_str()) else {
            continue;
        };
        if parent.row.service == f.row.service {
            continue;
        }
        let key = EdgeKey {
            bucket: format_ch_minute(f.start),
            env: f.row.env.clone(),
            caller_service: parent.row.service.clone(),
            callee_service: f.row.service.clone(),
            caller_version: parent.row.version.clone(),
            callee_version: f.row.version.clone(),
        };
        let acc = agg.entry(key).or_default();
        acc.durations.push(f.row.duration_ms);
        if f.row.is_error == 1 {
            acc.error_calls += 1;
        }
    }
}

fn collapse_edges(agg: BTreeMap<EdgeKey, EdgeAcc>) -> Vec<DependencyEdgeRow> {
    let mut out = Vec::with_capacity(agg.len());
    for (key, mut acc) in agg {
        acc.durations.sort_unstable();
        let calls = acc.durations.len();
        if calls == 0 {
            continue;
        }
        out.push(DependencyEdgeRow {
            bucket_ts: key.bucket,
            env: key.env,
            caller_service: key.caller_service,
            callee_service: key.callee_service,
            caller_version: key.caller_version,
            callee_version: key.callee_version,
            calls: calls as u64,
            error_calls: acc.error_calls,
            p50_ms: percentile(&acc.durations, 0.50),
            p95_ms: percentile(&acc.durations, 0.95),
            max_ms: acc.durations[calls - 1],
        });
    }
    out
}

/// Nearest-rank-below percentile: value at index `floor((n-1)·p)` of the
/// sorted array.
fn percentile(sorted: &[u32], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p) as usize;
    f64::from(sorted[idx.min(sorted.len() - 1)])
}
