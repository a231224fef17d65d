use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};

use tracelite_core::error::TraceLiteError;
use tracelite_core::time::{format_ch_minute, format_ch_time};
use tracelite_store::{Row, Store};

use crate::analysis::{build_anomaly_badges, build_dependency_diff, build_root_cause_ranking};
use crate::drilldown::build_trace_drilldown;
use crate::sql::{parse_limit, parse_range, sanitize};

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/traces", get(traces))
        .route("/v1/traces/{id}", get(trace_by_id))
        .route("/v1/traces/{id}/{mode}", get(trace_drilldown))
        .route("/v1/dependency", get(dependency))
        .route("/v1/dependency/diff", get(dependency_diff))
        .route("/v1/hosts", get(hosts))
        .route("/v1/compare", get(compare))
        .route("/v1/errors", get(errors))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct QueryParams {
    from: Option<String>,
    to: Option<String>,
    env: Option<String>,
    service: Option<String>,
    base: Option<String>,
    cand: Option<String>,
    limit: Option<String>,
}

enum ApiError {
    BadRequest(String),
    Upstream(String),
}

impl From<TraceLiteError> for ApiError {
    fn from(e: TraceLiteError) -> Self {
        ApiError::Upstream(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg).into_response(),
        }
    }
}

async fn healthz(State(state): State<ApiState>) -> Response {
    match tokio::time::timeout(std::time::Duration::from_secs(2), state.store.ping()).await {
        Ok(Ok(())) => Json(json!({"status": "ok"})).into_response(),
        Ok(Err(e)) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "store ping timed out".to_string()).into_response(),
    }
}

async fn traces(
    State(state): State<ApiState>,
    Query(params): Query<QueryParams>,
) -> Result<Json<Value>, ApiError> {
    let (from, to) = parse_range(params.from.as_deref(), params.to.as_deref());
    let limit = parse_limit(params.limit.as_deref(), 200);
    let env = sanitize(params.env.as_deref());
    let service = sanitize(params.service.as_deref());

    let mut filters = vec![
        format!("start_ts >= toDateTime64('{}', 3, 'UTC')", format_ch_time(from)),
        format!("start_ts < toDateTime64('{}', 3, 'UTC')", format_ch_time(to)),
    ];
    if !env.is_empty() {
        filters.push(format!("env = '{env}'"));
    }
    if !service.is_empty() {
        filters.push(format!("root_service = '{service}'"));
    }

    let sql = format!(
        "SELECT trace_id, env, root_service, start_ts, end_ts, duration_ms, span_count, \
         service_count, error_count, critical_path_ms, versions\n\
         FROM traces\nWHERE {}\nORDER BY start_ts DESC\nLIMIT {}",
        filters.join(" AND "),
        limit
    );
    let data = state.store.query(&sql).await?;
    Ok(Json(json!({"data": data})))
}

async fn trace_by_id(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = require_trace_id(&id)?;
    let (trace, spans) = fetch_trace_rows(&state.store, &id).await?;
    Ok(Json(json!({"trace": trace, "spans": spans})))
}

async fn trace_drilldown(
    State(state): State<ApiState>,
    Path((id, mode)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let id = require_trace_id(&id)?;
    let (trace, spans) = fetch_trace_rows(&state.store, &id).await?;

    match mode.trim().to_lowercase().as_str() {
        "waterfall" | "drilldown" => {
            let mut drill = build_trace_drilldown(&spans);
            if let Value::Object(map) = &mut drill {
                map.insert("trace".to_string(), trace);
            }
            Ok(Json(drill))
        }
        _ => Ok(Json(json!({"trace": trace, "spans": spans}))),
    }
}

fn require_trace_id(raw: &str) -> Result<String, ApiError> {
    let id = sanitize(Some(raw));
    if id.is_empty() {
        return Err(ApiError::BadRequest("invalid trace id".to_string()));
    }
    Ok(id)
}

async fn fetch_trace_rows(store: &Store, id: &str) -> Result<(Value, Vec<Row>), ApiError> {
    let trace_sql = format!(
        "SELECT trace_id, env, root_service, start_ts, end_ts, duration_ms, span_count, \
         service_count, error_count, critical_path_ms, versions\n\
         FROM traces\nWHERE trace_id = '{id}'\nORDER BY updated_at DESC\nLIMIT 1"
    );
    let trace_rows = store.query(&trace_sql).await?;

    let span_sql = format!(
        "SELECT trace_id, span_id, parent_span_id, service, env, host, version, operation, \
         start_ts, end_ts, duration_ms, self_time_ms, status_code, is_error, source\n\
         FROM spans\nWHERE trace_id = '{id}'\nORDER BY start_ts ASC"
    );
    let span_rows = store.query(&span_sql).await?;

    Ok((first_or_null(trace_rows), span_rows))
}

fn first_or_null(rows: Vec<Row>) -> Value {
    rows.into_iter().next().map_or(Value::Null, Value::Object)
}

async fn dependency(
    State(state): State<ApiState>,
    Query(params): Query<QueryParams>,
) -> Result<Json<Value>, ApiError> {
    let (from, to) = parse_range(params.from.as_deref(), params.to.as_deref());
    let env = sanitize(params.env.as_deref());

    let mut filters = vec![
        format!("bucket_ts >= toDateTime('{}', 'UTC')", format_ch_minute(from)),
        format!("bucket_ts < toDateTime('{}', 'UTC')", format_ch_minute(to)),
    ];
    if !env.is_empty() {
        filters.push(format!("env = '{env}'"));
    }

    let sql = format!(
        "SELECT\n  caller_service, callee_service, calls, error_calls, avg_latency_ms, p95_ms, max_ms,\n  \
         round(if(calls = 0, 0, error_calls / calls), 4) AS error_rate\n\
         FROM (\n  SELECT\n    caller_service,\n    callee_service,\n    sum(calls) AS calls,\n    \
         sum(error_calls) AS error_calls,\n    round(avg((p50_ms + p95_ms)/2), 2) AS avg_latency_ms,\n    \
         round(avg(p95_ms), 2) AS p95_ms,\n    max(max_ms) AS max_ms\n  \
         FROM dependency_edges_minute\n  WHERE {}\n  GROUP BY caller_service, callee_service\n)\n\
         ORDER BY calls DESC\nLIMIT 1000",
        filters.join(" AND ")
    );
    let data = state.store.query(&sql).await?;
    Ok(Json(json!({"edges": data})))
}

async fn dependency_diff(
    State(state): State<ApiState>,
    Query(params): Query<QueryParams>,
) -> Result<Json<Value>, ApiError> {
    let (from, to) = parse_range(params.from.as_deref(), params.to.as_deref());
    let env = sanitize(params.env.as_deref());
    let service = sanitize(params.service.as_deref());
    let base = sanitize(params.base.as_deref());
    let cand = sanitize(params.cand.as_deref());
    if base.is_empty() || cand.is_empty() {
        return Err(ApiError::BadRequest("base/cand are required".to_string()));
    }

    let mut common = vec![
        format!("bucket_ts >= toDateTime('{}', 'UTC')", format_ch_minute(from)),
        format!("bucket_ts < toDateTime('{}', 'UTC')", format_ch_minute(to)),
    ];
    if !env.is_empty() {
        common.push(format!("env = '{env}'"));
    }
    if !service.is_empty() {
        common.push(format!(
            "(caller_service = '{service}' OR callee_service = '{service}')"
        ));
    }

    let edge_sql = |version: &str| {
        let mut filters = common.clone();
        filters.push(format!(
            "(caller_version = '{version}' OR callee_version = '{version}')"
        ));
        format!(
            "SELECT caller_service, callee_service, calls, p95_ms,\n       \
             round(if(calls = 0, 0, error_calls / calls), 4) AS error_rate\n\
             FROM (\n  SELECT caller_service, callee_service,\n         sum(calls) AS calls,\n         \
             sum(error_calls) AS error_calls,\n         round(avg(p95_ms), 2) AS p95_ms\n  \
             FROM dependency_edges_minute\n  WHERE {}\n  GROUP BY caller_service, callee_service\n)",
            filters.join(" AND ")
        )
    };

    let base_rows = state.store.query(&edge_sql(&base)).await?;
    let cand_rows = state.store.query(&edge_sql(&cand)).await?;
    Ok(Json(build_dependency_diff(&base_rows, &cand_rows)))
}

async fn hosts(
    State(state): State<ApiState>,
    Query(params): Query<QueryParams>,
) -> Result<Json<Value>, ApiError> {
    let (from, to) = parse_range(params.from.as_deref(), params.to.as_deref());
    let env = sanitize(params.env.as_deref());

    let mut filters = vec![
        format!("bucket_ts >= toDateTime('{}', 'UTC')", format_ch_minute(from)),
        format!("bucket_ts < toDateTime('{}', 'UTC')", format_ch_minute(to)),
    ];
    if !env.is_empty() {
        filters.push(format!("env = '{env}'"));
    }

    let sql = format!(
        "SELECT\n  host, logs, errors, last_seen, active_services,\n  \
         round(if(logs = 0, 0, errors / logs), 4) AS error_rate\n\
         FROM\n(\n  SELECT\n    host,\n    sum(logs) AS logs,\n    sum(errors) AS errors,\n    \
         max(last_seen_ts) AS last_seen,\n    max(distinct_services) AS active_services\n  \
         FROM host_stats_minute\n  WHERE {}\n  GROUP BY host\n)\n\
         ORDER BY logs DESC\nLIMIT 2000",
        filters.join(" AND ")
    );
    let data = state.store.query(&sql).await?;
    Ok(Json(json!({"hosts": data})))
}

async fn compare(
    State(state): State<ApiState>,
    Query(params): Query<QueryParams>,
) -> Result<Json<Value>, ApiError> {
    let (from, to) = parse_range(params.from.as_deref(), params.to.as_deref());
    let env = sanitize(params.env.as_deref());
    let service = sanitize(params.service.as_deref());
    let base = sanitize(params.base.as_deref());
    let cand = sanitize(params.cand.as_deref());
    if service.is_empty() || base.is_empty() || cand.is_empty() {
        return Err(ApiError::BadRequest("service/base/cand are required".to_string()));
    }

    let mut trace_filters = vec![
        format!("start_ts >= toDateTime64('{}', 3, 'UTC')", format_ch_time(from)),
        format!("start_ts < toDateTime64('{}', 3, 'UTC')", format_ch_time(to)),
        format!("root_service = '{service}'"),
    ];
    if !env.is_empty() {
        trace_filters.push(format!("env = '{env}'"));
    }
    let trace_subquery = format!(
        "SELECT trace_id FROM traces WHERE {}",
        trace_filters.join(" AND ")
    );
    let span_where_all =
        format!("trace_id IN ({trace_subquery}) AND version IN ('{base}', '{cand}')");
    let span_where_service = format!("{span_where_all} AND service = '{service}'");

    let metrics_sql = format!(
        "SELECT\n  version,\n  count() AS spans,\n  \
         round(quantile(0.50)(duration_ms), 2) AS p50_ms,\n  \
         round(quantile(0.95)(duration_ms), 2) AS p95_ms,\n  \
         round(quantile(0.99)(duration_ms), 2) AS p99_ms,\n  \
         round(avg(is_error), 4) AS error_rate\n\
         FROM spans\nWHERE {span_where_service}\nGROUP BY version"
    );

    let delta_sql = format!(
        "SELECT\n  operation,\n  \
         round(quantileIf(0.95)(duration_ms, version = '{base}'), 2) AS base_p95_ms,\n  \
         round(quantileIf(0.95)(duration_ms, version = '{cand}'), 2) AS cand_p95_ms,\n  \
         round(cand_p95_ms - base_p95_ms, 2) AS delta_p95_ms,\n  \
         countIf(version = '{base}') AS base_calls,\n  \
         countIf(version = '{cand}') AS cand_calls\n\
         FROM spans\nWHERE {span_where_service}\nGROUP BY operation\n\
         HAVING base_calls > 0 AND cand_calls > 0\nORDER BY delta_p95_ms DESC\nLIMIT 200"
    );

    let root_cause_sql = format!(
        "SELECT\n  service,\n  version,\n  count() AS calls,\n  \
         round(quantile(0.95)(duration_ms), 2) AS p95_ms,\n  \
         round(avg(is_error), 4) AS error_rate,\n  \
         round(avg(greatest(duration_ms - self_time_ms, 0)), 2) AS wait_ms,\n  \
         round(avg(if(duration_ms = 0, 0, greatest(duration_ms - self_time_ms, 0) / duration_ms)), 4) AS blocking_ratio\n\
         FROM spans\nWHERE {span_where_all}\nGROUP BY service, version"
    );

    let summary_sql = format!(
        "SELECT\n  round(quantileIf(0.95)(duration_ms, version = '{base}'), 2) AS base_p95,\n  \
         round(quantileIf(0.95)(duration_ms, version = '{cand}'), 2) AS cand_p95,\n  \
         round(avgIf(is_error, version = '{base}'), 4) AS base_error_rate,\n  \
         round(avgIf(is_error, version = '{cand}'), 4) AS cand_error_rate,\n  \
         countIf(version = '{base}') AS base_calls,\n  \
         countIf(version = '{cand}') AS cand_calls\n\
         FROM spans\nWHERE {span_where_service}"
    );

    let metrics = state.store.query(&metrics_sql).await?;
    let deltas = state.store.query(&delta_sql).await?;
    let root_rows = state.store.query(&root_cause_sql).await?;
    let summary_rows = state.store.query(&summary_sql).await?;

    Ok(Json(json!({
        "metrics": metrics,
        "operation_diff": deltas,
        "root_causes": build_root_cause_ranking(&root_rows, &base, &cand),
        "anomalies": build_anomaly_badges(&summary_rows),
    })))
}

async fn errors(
    State(state): State<ApiState>,
    Query(params): Query<QueryParams>,
) -> Result<Json<Value>, ApiError> {
    let (from, to) = parse_range(params.from.as_deref(), params.to.as_deref());
    let env = sanitize(params.env.as_deref());
    let service = sanitize(params.service.as_deref());
    let base = sanitize(params.base.as_deref());
    let cand = sanitize(params.cand.as_deref());

    let mut trace_filters = vec![
        format!("start_ts >= toDateTime64('{}', 3, 'UTC')", format_ch_time(from)),
        format!("start_ts < toDateTime64('{}', 3, 'UTC')", format_ch_time(to)),
    ];
    if !env.is_empty() {
        trace_filters.push(format!("env = '{env}'"));
    }
    if !service.is_empty() {
        trace_filters.push(format!("root_service = '{service}'"));
    }
    let trace_subquery = format!(
        "SELECT trace_id FROM traces WHERE {}",
        trace_filters.join(" AND ")
    );
    let span_where = format!("trace_id IN ({trace_subquery})");

    let breakdown_sql = format!(
        "SELECT service,\n       countIf(is_error = 1) AS errors,\n       count() AS calls,\n       \
         round(countIf(is_error = 1) / greatest(count(), 1), 4) AS error_rate\n\
         FROM spans\nWHERE {span_where}\nGROUP BY service\nORDER BY errors DESC, calls DESC"
    );

    let top_ops_sql = format!(
        "SELECT service, operation,\n       countIf(is_error = 1) AS errors,\n       count() AS calls,\n       \
         round(countIf(is_error = 1) / greatest(count(), 1), 4) AS error_rate\n\
         FROM spans\nWHERE {span_where}\nGROUP BY service, operation\n\
         HAVING errors > 0\nORDER BY errors DESC, error_rate DESC\nLIMIT 20"
    );

    let mut edge_filters = vec![
        format!("bucket_ts >= toDateTime('{}', 'UTC')", format_ch_minute(from)),
        format!("bucket_ts < toDateTime('{}', 'UTC')", format_ch_minute(to)),
    ];
    if !env.is_empty() {
        edge_filters.push(format!("env = '{env}'"));
    }
    if !service.is_empty() {
        edge_filters.push(format!(
            "(caller_service = '{service}' OR callee_service = '{service}')"
        ));
    }
    let propagation_sql = format!(
        "SELECT caller_service, callee_service, error_calls, calls,\n       \
         round(if(calls = 0, 0, error_calls / calls), 4) AS error_rate\n\
         FROM (\n  SELECT caller_service, callee_service,\n         sum(error_calls) AS error_calls,\n         \
         sum(calls) AS calls\n  FROM dependency_edges_minute\n  WHERE {}\n  \
         GROUP BY caller_service, callee_service\n)\n\
         WHERE error_calls > 0\nORDER BY error_calls DESC\nLIMIT 20",
        edge_filters.join(" AND ")
    );

    let breakdown = state.store.query(&breakdown_sql).await?;
    let top_ops = state.store.query(&top_ops_sql).await?;
    let propagation = state.store.query(&propagation_sql).await?;

    let new_errors = if !base.is_empty() && !cand.is_empty() {
        let new_errors_sql = format!(
            "SELECT service, operation,\n       \
             countIf(is_error = 1 AND version = '{base}') AS base_errors,\n       \
             countIf(is_error = 1 AND version = '{cand}') AS cand_errors\n\
             FROM spans\nWHERE {span_where} AND version IN ('{base}', '{cand}')\n\
             GROUP BY service, operation\nHAVING base_errors = 0 AND cand_errors > 0\n\
             ORDER BY cand_errors DESC\nLIMIT 20"
        );
        state.store.query(&new_errors_sql).await?
    } else {
        Vec::new()
    };

    Ok(Json(json!({
        "service_breakdown": breakdown,
        "top_operations": top_ops,
        "propagation_map": propagation,
        "new_errors": new_errors,
    })))
}
