use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracelite_store::Row;

use tracelite_core::time::{format_ch_time, parse_ch_time};

use crate::analysis::round_to;
use crate::value::{to_f64, to_string, to_u32};

struct SpanNode {
    trace_id: String,
    span_id: String,
    parent_span_id: String,
    service: String,
    host: String,
    version: String,
    operation: String,
    start_ts: String,
    end_ts: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    duration_ms: u32,
    self_time_ms: u32,
    wait_ms: u32,
    blocking_ratio: f64,
    is_error: bool,
    depth: usize,
    children: Vec<usize>,
    is_critical: bool,
    left_pct: f64,
    width_pct: f64,
    explanation: String,
}

/// Builds the waterfall payload for one trace's span rows: depth and bar
/// geometry, the critical path, root-to-error chains, and ranked slow spots.
pub fn build_trace_drilldown(rows: &[Row]) -> Value {
    let mut nodes = parse_nodes(rows);

    // Later duplicates win, mirroring the store's last-write-wins upserts.
    let mut by_id: HashMap<String, usize> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        if !node.span_id.is_empty() {
            by_id.insert(node.span_id.clone(), i);
        }
    }

    let mut roots: Vec<usize> = Vec::new();
    for i in 0..nodes.len() {
        let parent = nodes[i].parent_span_id.clone();
        match by_id.get(&parent) {
            Some(&p) if !parent.is_empty() && p != i => nodes[p].children.push(i),
            _ => roots.push(i),
        }
    }

    sort_by_start(&mut roots, &nodes);
    for i in 0..nodes.len() {
        let mut kids = std::mem::take(&mut nodes[i].children);
        sort_by_start(&mut kids, &nodes);
        nodes[i].children = kids;
    }
    set_depth(&mut nodes, &roots);

    let (trace_start, trace_end) = trace_window(&nodes);
    let total_ms = trace_end
        .signed_duration_since(trace_start)
        .num_milliseconds()
        .max(1) as f64;

    let critical_ids = critical_path(&nodes, &roots);
    let critical_set: HashSet<&str> = critical_ids.iter().map(String::as_str).collect();

    let mut max_wait = 1u32;
    for node in &nodes {
        max_wait = max_wait.max(node.wait_ms);
    }

    let mut error_chains: Vec<Value> = Vec::new();
    for i in 0..nodes.len() {
        nodes[i].is_critical = critical_set.contains(nodes[i].span_id.as_str());

        let left = nodes[i]
            .start_time
            .signed_duration_since(trace_start)
            .num_milliseconds()
            .max(0) as f64;
        nodes[i].left_pct = left / total_ms * 100.0;
        nodes[i].width_pct = (f64::from(nodes[i].duration_ms) / total_ms * 100.0).max(0.8);

        let mut waiting_on = String::new();
        let mut longest_child = 0u32;
        for &c in &nodes[i].children {
            if nodes[c].duration_ms > longest_child {
                longest_child = nodes[c].duration_ms;
                waiting_on = nodes[c].service.clone();
            }
        }
        let explanation = if waiting_on.is_empty() {
            format!(
                "{} total:{}ms self:{}ms waiting:{}ms",
                nodes[i].service, nodes[i].duration_ms, nodes[i].self_time_ms, nodes[i].wait_ms
            )
        } else {
            format!(
                "{} total:{}ms self:{}ms waiting:{}ms on {}({}ms)",
                nodes[i].service,
                nodes[i].duration_ms,
                nodes[i].self_time_ms,
                nodes[i].wait_ms,
                waiting_on,
                longest_child
            )
        };
        nodes[i].explanation = explanation;

        if nodes[i].is_error {
            error_chains.push(json!({
                "error_span_id": nodes[i].span_id,
                "path": error_path(&nodes, &by_id, i),
            }));
        }
    }

    let mut slow: Vec<Value> = nodes
        .iter()
        .map(|node| {
            let score =
                0.6 * (f64::from(node.wait_ms) / f64::from(max_wait)) + 0.4 * node.blocking_ratio;
            json!({
                "span_id": node.span_id,
                "service": node.service,
                "operation": node.operation,
                "duration_ms": node.duration_ms,
                "self_time_ms": node.self_time_ms,
                "wait_ms": node.wait_ms,
                "blocking_ratio": round_to(node.blocking_ratio * 100.0, 2),
                "score": round_to(score, 4),
                "is_critical": node.is_critical,
                "is_error": node.is_error,
                "explanation": node.explanation,
                "parent_span_id": node.parent_span_id,
                "child_span_count": node.children.len(),
            })
        })
        .collect();
    slow.sort_by(|a, b| {
        to_f64(b.get("score"))
            .partial_cmp(&to_f64(a.get("score")))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    slow.truncate(10);

    let mut order: Vec<usize> = (0..nodes.len()).collect();
    sort_by_start(&mut order, &nodes);
    let waterfall: Vec<Value> = order
        .iter()
        .map(|&i| {
            let node = &nodes[i];
            let child_ids: Vec<&str> = node
                .children
                .iter()
                .map(|&c| nodes[c].span_id.as_str())
                .collect();
            json!({
                "trace_id": node.trace_id,
                "span_id": node.span_id,
                "parent_span_id": node.parent_span_id,
                "service": node.service,
                "host": node.host,
                "version": node.version,
                "operation": node.operation,
                "start_ts": node.start_ts,
                "end_ts": node.end_ts,
                "duration_ms": node.duration_ms,
                "self_time_ms": node.self_time_ms,
                "wait_ms": node.wait_ms,
                "blocking_ratio": round_to(node.blocking_ratio * 100.0, 2),
                "depth": node.depth,
                "is_critical": node.is_critical,
                "is_error": node.is_error,
                "left_pct": round_to(node.left_pct, 2),
                "width_pct": round_to(node.width_pct, 2),
                "children": child_ids,
                "explanation": node.explanation,
            })
        })
        .collect();

    json!({
        "waterfall": waterfall,
        "critical_path": critical_ids,
        "error_chains": error_chains,
        "slow_spots": slow,
        "trace_window": {
            "start_ts": format_ch_time(trace_start),
            "end_ts": format_ch_time(trace_end),
            "total_ms": total_ms as u64,
        },
    })
}

fn parse_nodes(rows: &[Row]) -> Vec<SpanNode> {
    rows.iter()
        .map(|row| {
            let duration_ms = to_u32(row.get("duration_ms"));
            let mut self_time_ms = to_u32(row.get("self_time_ms"));
            if self_time_ms > duration_ms {
                self_time_ms = duration_ms;
            }
            let wait_ms = duration_ms - self_time_ms;
            let blocking_ratio = if duration_ms > 0 {
                f64::from(wait_ms) / f64::from(duration_ms)
            } else {
                0.0
            };

            let start_ts = to_string(row.get("start_ts"));
            let end_ts = to_string(row.get("end_ts"));
            let start_time = parse_ch_time(&start_ts).unwrap_or_else(Utc::now);
            let mut end_time = parse_ch_time(&end_ts).unwrap_or_else(Utc::now);
            if end_time < start_time {
                end_time = start_time;
            }

            SpanNode {
                trace_id: to_string(row.get("trace_id")),
                span_id: to_string(row.get("span_id")),
                parent_span_id: to_string(row.get("parent_span_id")),
                service: to_string(row.get("service")),
                host: to_string(row.get("host")),
                version: to_string(row.get("version")),
                operation: to_string(row.get("operation")),
                start_ts,
                end_ts,
                start_time,
                end_time,
                duration_ms,
                self_time_ms,
                wait_ms,
                blocking_ratio,
                is_error: to_f64(row.get("is_error")) > 0.0,
                depth: 0,
                children: Vec::new(),
                is_critical: false,
                left_pct: 0.0,
                width_pct: 0.0,
                explanation: String::new(),
            }
        })
        .collect()
}

fn sort_by_start(indices: &mut [usize], nodes: &[SpanNode]) {
    indices.sort_by(|&a, &b| {
        (nodes[a].start_time, &nodes[a].span_id).cmp(&(nodes[b].start_time, &nodes[b].span_id))
    });
}

fn set_depth(nodes: &mut [SpanNode], roots: &[usize]) {
    let mut stack: Vec<(usize, usize)> = roots.iter().map(|&r| (r, 0)).collect();
    while let Some((i, depth)) = stack.pop() {
        nodes[i].depth = depth;
        for &c in &nodes[i].children.clone() {
            stack.push((c, depth + 1));
        }
    }
}

fn trace_window(nodes: &[SpanNode]) -> (DateTime<Utc>, DateTime<Utc>) {
    let Some(first) = nodes.first() else {
        let now = Utc::now();
        return (now, now);
    };
    let mut start = first.start_time;
    let mut end = first.end_time;
    for node in nodes {
        if node.start_time < start {
            start = node.start_time;
        }
        if node.end_time > end {
            end = node.end_time;
        }
    }
    (start, end)
}

/// From the earliest-started root, repeatedly descend into the child that
/// finishes last.
fn critical_path(nodes: &[SpanNode], roots: &[usize]) -> Vec<String> {
    let Some(&first) = roots.first() else {
        return Vec::new();
    };
    let mut root = first;
    for &r in roots {
        if nodes[r].start_time < nodes[root].start_time {
            root = r;
        }
    }

    let mut path = Vec::new();
    let mut current = root;
    loop {
        path.push(nodes[current].span_id.clone());
        let Some(&next) = nodes[current].children.first() else {
            break;
        };
        let mut best = next;
        for &c in &nodes[current].children[1..] {
            if nodes[c].end_time > nodes[best].end_time {
                best = c;
            }
        }
        current = best;
    }
    path
}

/// Root-to-error ancestor chain as `service(span_id)` strings. The seen set
/// stops malformed parent loops.
fn error_path(nodes: &[SpanNode], by_id: &HashMap<String, usize>, error: usize) -> Vec<String> {
    let mut path = Vec::new();
    let mut seen: HashSet<usize> = HashSet::new();
    let mut current = error;
    loop {
        if !seen.insert(current) {
            break;
        }
        path.push(format!("{}({})", nodes[current].service, nodes[current].span_id));
        if nodes[current].parent_span_id.is_empty() {
            break;
        }
        let Some(&parent) = by_id.get(&nodes[current].parent_span_id) else {
            break;
        };
        current = parent;
    }
    path.reverse();
    path
}
