use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use serde_json::{Value, json};
use tracelite_store::Row;

use crate::value::{to_f64, to_string};

/// Percentage change from `base` to `cand`. A metric appearing from zero
/// counts as +100% rather than infinity.
pub fn pct_delta(base: f64, cand: f64) -> f64 {
    if base == 0.0 {
        if cand == 0.0 { 0.0 } else { 100.0 }
    } else {
        (cand - base) / base.abs() * 100.0
    }
}

pub fn clamp(v: f64, min: f64, max: f64) -> f64 {
    if v < min {
        min
    } else if v > max {
        max
    } else {
        v
    }
}

pub(crate) fn round_to(v: f64, digits: i32) -> f64 {
    let pow = 10f64.powi(digits);
    (v * pow).round() / pow
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RootCauseRank {
    pub service: String,
    pub score: f64,
    pub latency_delta_pct: f64,
    pub error_delta_pct: f64,
    pub call_delta_pct: f64,
    pub blocking_ratio: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default)]
struct VersionStats {
    calls: f64,
    p95: f64,
    error_rate: f64,
    blocking_ratio: f64,
}

/// Ranks services by regression severity between two versions. Latency
/// dominates the score, then errors, traffic, and how much of the candidate's
/// time is spent blocked on children.
pub fn build_root_cause_ranking(rows: &[Row], base: &str, cand: &str) -> Vec<RootCauseRank> {
    let mut base_stats: HashMap<String, VersionStats> = HashMap::new();
    let mut cand_stats: HashMap<String, VersionStats> = HashMap::new();

    for row in rows {
        let stats = VersionStats {
            calls: to_f64(row.get("calls")),
            p95: to_f64(row.get("p95_ms")),
            error_rate: to_f64(row.get("error_rate")),
            blocking_ratio: to_f64(row.get("blocking_ratio")),
        };
        let service = to_string(row.get("service"));
        let version = to_string(row.get("version"));
        if version == base {
            base_stats.insert(service.clone(), stats);
        }
        if version == cand {
            cand_stats.insert(service, stats);
        }
    }

    let services: BTreeSet<String> = base_stats.keys().chain(cand_stats.keys()).cloned().collect();

    let mut out: Vec<RootCauseRank> = services
        .into_iter()
        .map(|service| {
            let b = base_stats.get(&service).copied().unwrap_or_default();
            let c = cand_stats.get(&service).copied().unwrap_or_default();
            let lat_pct = pct_delta(b.p95, c.p95);
            let err_pct = pct_delta(b.error_rate, c.error_rate);
            let call_pct = pct_delta(b.calls, c.calls);
            let score = 0.50 * clamp(lat_pct / 300.0, 0.0, 1.0)
                + 0.25 * clamp(err_pct / 300.0, 0.0, 1.0)
                + 0.15 * clamp(call_pct / 300.0, 0.0, 1.0)
                + 0.10 * clamp(c.blocking_ratio, 0.0, 1.0);
            RootCauseRank {
                service,
                score: round_to(score, 4),
                latency_delta_pct: round_to(lat_pct, 2),
                error_delta_pct: round_to(err_pct, 2),
                call_delta_pct: round_to(call_pct, 2),
                blocking_ratio: round_to(c.blocking_ratio, 4),
                reason: format!(
                    "latency {lat_pct:+.1}%, error {err_pct:+.1}%, calls {call_pct:+.1}%"
                ),
            }
        })
        .collect();

    out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    out.truncate(10);
    out
}

/// Categorized deviation badges over the version summary row.
pub fn build_anomaly_badges(rows: &[Row]) -> Vec<Value> {
    let Some(row) = rows.first() else {
        return Vec::new();
    };

    let lat_pct = pct_delta(to_f64(row.get("base_p95")), to_f64(row.get("cand_p95")));
    let err_pct = pct_delta(
        to_f64(row.get("base_error_rate")),
        to_f64(row.get("cand_error_rate")),
    );
    let call_pct = pct_delta(to_f64(row.get("base_calls")), to_f64(row.get("cand_calls")));

    let deviation = clamp(
        (lat_pct.abs() / 300.0)
            .max(err_pct.abs() / 300.0)
            .max(call_pct.abs() / 300.0),
        0.0,
        1.0,
    );
    let deviation = round_to(deviation, 3);

    let mut badges = Vec::new();
    if lat_pct >= 100.0 {
        badges.push(json!({
            "level": "orange",
            "title": "Latency spike detected",
            "message": format!("p95 +{lat_pct:.1}%"),
            "deviation_score": deviation,
        }));
    }
    if err_pct >= 50.0 {
        badges.push(json!({
            "level": "red",
            "title": "Error anomaly detected",
            "message": format!("error rate +{err_pct:.1}%"),
            "deviation_score": deviation,
        }));
    }
    if call_pct >= 100.0 {
        badges.push(json!({
            "level": "yellow",
            "title": "Traffic spike detected",
            "message": format!("calls +{call_pct:.1}%"),
            "deviation_score": deviation,
        }));
    }
    badges
}

#[derive(Debug, Clone, Copy, Default)]
struct EdgeStats {
    calls: f64,
    p95: f64,
    error_rate: f64,
}

/// Structural diff of the dependency graph between two version-filtered
/// aggregations. Edges are keyed by (caller, callee).
pub fn build_dependency_diff(base_rows: &[Row], cand_rows: &[Row]) -> Value {
    let collect = |rows: &[Row]| -> HashMap<(String, String), EdgeStats> {
        rows.iter()
            .map(|row| {
                (
                    (
                        to_string(row.get("caller_service")),
                        to_string(row.get("callee_service")),
                    ),
                    EdgeStats {
                        calls: to_f64(row.get("calls")),
                        p95: to_f64(row.get("p95_ms")),
                        error_rate: to_f64(row.get("error_rate")),
                    },
                )
            })
            .collect()
    };
    let base_map = collect(base_rows);
    let cand_map = collect(cand_rows);

    let keys: BTreeSet<(String, String)> = base_map.keys().chain(cand_map.keys()).cloned().collect();

    let mut new_count = 0;
    let mut removed_count = 0;
    let mut changed_count = 0;
    let mut edges: Vec<Value> = Vec::with_capacity(keys.len());
    for (caller, callee) in keys {
        let key = (caller.clone(), callee.clone());
        let base = base_map.get(&key);
        let cand = cand_map.get(&key);
        let status = match (base, cand) {
            (None, Some(_)) => {
                new_count += 1;
                "new"
            }
            (Some(_), None) => {
                removed_count += 1;
                "removed"
            }
            _ => {
                changed_count += 1;
                "changed"
            }
        };
        let b = base.copied().unwrap_or_default();
        let c = cand.copied().unwrap_or_default();
        let call_diff_pct = pct_delta(b.calls, c.calls);

        edges.push(json!({
            "caller_service": caller,
            "callee_service": callee,
            "status": status,
            "base_calls": b.calls,
            "cand_calls": c.calls,
            "call_diff": c.calls - b.calls,
            "call_diff_pct": call_diff_pct,
            "base_p95_ms": b.p95,
            "cand_p95_ms": c.p95,
            "p95_diff_ms": c.p95 - b.p95,
            "base_error_rate": b.error_rate,
            "cand_error_rate": c.error_rate,
            "error_rate_diff": c.error_rate - b.error_rate,
            "is_new_edge": status == "new",
            "is_removed_edge": status == "removed",
            "is_high_call_increase": call_diff_pct >= 100.0,
        }));
    }

    edges.sort_by(|a, b| {
        to_f64(b.get("call_diff_pct"))
            .partial_cmp(&to_f64(a.get("call_diff_pct")))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    json!({
        "summary": {
            "new_edges": new_count,
            "removed_edges": removed_count,
            "changed_edges": changed_count,
        },
        "edges": edges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        let mut map = Row::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.clone());
        }
        map
    }

    #[test]
    fn pct_delta_edge_cases() {
        assert_eq!(pct_delta(0.0, 0.0), 0.0);
        assert_eq!(pct_delta(0.0, 50.0), 100.0);
        assert_eq!(pct_delta(100.0, 150.0), 50.0);
        assert_eq!(pct_delta(200.0, 100.0), -50.0);
        assert_eq!(pct_delta(-100.0, -50.0), 50.0);
    }

    #[test]
    fn clamp_caps_both_ends() {
        assert_eq!(clamp(-0.5, 0.0, 1.0), 0.0);
        assert_eq!(clamp(0.5, 0.0, 1.0), 0.5);
        assert_eq!(clamp(7.0, 0.0, 1.0), 1.0);
    }

    #[test]
    fn root_cause_scores_and_sorts() {
        let rows = vec![
            row(&[
                ("service", json!("svc-a")),
                ("version", json!("v1")),
                ("calls", json!(100)),
                ("p95_ms", json!(100.0)),
                ("error_rate", json!(0.0)),
                ("blocking_ratio", json!(0.0)),
            ]),
            row(&[
                ("service", json!("svc-a")),
                ("version", json!("v2")),
                ("calls", json!(100)),
                ("p95_ms", json!(400.0)),
                ("error_rate", json!(0.0)),
                ("blocking_ratio", json!(0.5)),
            ]),
            row(&[
                ("service", json!("svc-b")),
                ("version", json!("v1")),
                ("calls", json!(100)),
                ("p95_ms", json!(100.0)),
                ("error_rate", json!(0.0)),
                ("blocking_ratio", json!(0.0)),
            ]),
            row(&[
                ("service", json!("svc-b")),
                ("version", json!("v2")),
                ("calls", json!(100)),
                ("p95_ms", json!(110.0)),
                ("error_rate", json!(0.0)),
                ("blocking_ratio", json!(0.0)),
            ]),
        ];
        let ranks = build_root_cause_ranking(&rows, "v1", "v2");
        assert_eq!(ranks.len(), 2);
        assert_eq!(ranks[0].service, "svc-a");
        // 0.50 * clamp(300/300) + 0.10 * 0.5
        assert_eq!(ranks[0].score, 0.55);
        assert_eq!(ranks[0].latency_delta_pct, 300.0);
        assert_eq!(ranks[0].reason, "latency +300.0%, error +0.0%, calls +0.0%");
        assert!(ranks[1].score < ranks[0].score);
    }

    #[test]
    fn root_cause_keeps_top_ten() {
        let mut rows = Vec::new();
        for i in 0..15 {
            rows.push(row(&[
                ("service", json!(format!("svc-{i:02}"))),
                ("version", json!("v2")),
                ("calls", json!(10)),
                ("p95_ms", json!(100.0 + f64::from(i))),
                ("error_rate", json!(0.0)),
                ("blocking_ratio", json!(0.0)),
            ]));
        }
        let ranks = build_root_cause_ranking(&rows, "v1", "v2");
        assert_eq!(ranks.len(), 10);
    }

    #[test]
    fn latency_spike_from_zero_base_badges_orange() {
        let rows = vec![row(&[
            ("base_p95", json!(0.0)),
            ("cand_p95", json!(50.0)),
            ("base_error_rate", json!(0.0)),
            ("cand_error_rate", json!(0.0)),
            ("base_calls", json!(10)),
            ("cand_calls", json!(10)),
        ])];
        let badges = build_anomaly_badges(&rows);
        assert_eq!(badges.len(), 1);
        assert_eq!(badges[0]["level"], "orange");
        assert_eq!(badges[0]["title"], "Latency spike detected");
        assert_eq!(badges[0]["message"], "p95 +100.0%");
        assert_eq!(badges[0]["deviation_score"], json!(0.333));
    }

    #[test]
    fn all_badges_fire_over_thresholds() {
        let rows = vec![row(&[
            ("base_p95", json!(100.0)),
            ("cand_p95", json!(250.0)),
            ("base_error_rate", json!(0.01)),
            ("cand_error_rate", json!(0.02)),
            ("base_calls", json!(100)),
            ("cand_calls", json!(300)),
        ])];
        let badges = build_anomaly_badges(&rows);
        let levels: Vec<&str> = badges.iter().map(|b| b["level"].as_str().unwrap()).collect();
        assert_eq!(levels, vec!["orange", "red", "yellow"]);
    }

    #[test]
    fn quiet_summary_has_no_badges() {
        let rows = vec![row(&[
            ("base_p95", json!(100.0)),
            ("cand_p95", json!(110.0)),
            ("base_error_rate", json!(0.01)),
            ("cand_error_rate", json!(0.01)),
            ("base_calls", json!(100)),
            ("cand_calls", json!(105)),
        ])];
        assert!(build_anomaly_badges(&rows).is_empty());
        assert!(build_anomaly_badges(&[]).is_empty());
    }

    #[test]
    fn dependency_diff_classifies_edges() {
        let base = vec![row(&[
            ("caller_service", json!("A")),
            ("callee_service", json!("B")),
            ("calls", json!(100)),
            ("p95_ms", json!(20.0)),
            ("error_rate", json!(0.0)),
        ])];
        let cand = vec![
            row(&[
                ("caller_service", json!("A")),
                ("callee_service", json!("B")),
                ("calls", json!(200)),
                ("p95_ms", json!(30.0)),
                ("error_rate", json!(0.05)),
            ]),
            row(&[
                ("caller_service", json!("A")),
                ("callee_service", json!("C")),
                ("calls", json!(40)),
                ("p95_ms", json!(10.0)),
                ("error_rate", json!(0.0)),
            ]),
        ];

        let diff = build_dependency_diff(&base, &cand);
        assert_eq!(diff["summary"]["new_edges"], 1);
        assert_eq!(diff["summary"]["removed_edges"], 0);
        assert_eq!(diff["summary"]["changed_edges"], 1);

        let edges = diff["edges"].as_array().unwrap();
        assert_eq!(edges.len(), 2);
        let ab = edges
            .iter()
            .find(|e| e["callee_service"] == "B")
            .unwrap();
        assert_eq!(ab["status"], "changed");
        assert_eq!(ab["call_diff"], json!(100.0));
        assert_eq!(ab["call_diff_pct"], json!(100.0));
        assert_eq!(ab["is_high_call_increase"], json!(true));
        assert_eq!(ab["p95_diff_ms"], json!(10.0));

        let ac = edges
            .iter()
            .find(|e| e["callee_service"] == "C")
            .unwrap();
        assert_eq!(ac["status"], "new");
        assert_eq!(ac["is_new_edge"], json!(true));
        // New edges sort first on their +100% appearance delta.
        assert_eq!(edges[0]["call_diff_pct"], edges[1]["call_diff_pct"]);
    }

    #[test]
    fn dependency_diff_marks_removed() {
        let base = vec![row(&[
            ("caller_service", json!("A")),
            ("callee_service", json!("B")),
            ("calls", json!(10)),
            ("p95_ms", json!(5.0)),
            ("error_rate", json!(0.0)),
        ])];
        let diff = build_dependency_diff(&base, &[]);
        assert_eq!(diff["summary"]["removed_edges"], 1);
        let edge = &diff["edges"].as_array().unwrap()[0];
        assert_eq!(edge["status"], "removed");
        assert_eq!(edge["is_removed_edge"], json!(true));
        assert_eq!(edge["call_diff_pct"], json!(-100.0));
    }
}
