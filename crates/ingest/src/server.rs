use std::io::Read;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use flate2::read::GzDecoder;
use serde::Serialize;
use tracing::debug;

use tracelite_core::error::TraceLiteError;
use tracelite_store::Store;

use crate::parse::{IngestError, parse_events};
use crate::reconstruct::Reconstructor;

/// Decompressed body cap. Anything beyond is truncated; a split trailing
/// line surfaces as a per-line reject.
const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;
const MAX_REPORTED_ERRORS: usize = 100;

#[derive(Clone)]
pub struct IngestState {
    pub token: String,
    pub store: Store,
    pub recon: Arc<Reconstructor>,
}

pub fn router(state: IngestState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/ingest/logs", post(ingest_logs))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

#[derive(Serialize)]
struct IngestResponse {
    accepted: usize,
    rejected: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<IngestError>,
}

async fn healthz(State(state): State<IngestState>) -> Response {
    match tokio::time::timeout(std::time::Duration::from_secs(2), state.store.ping()).await {
        Ok(Ok(())) => axum::Json(serde_json::json!({"status": "ok"})).into_response(),
        Ok(Err(e)) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "store ping timed out".to_string()).into_response(),
    }
}

async fn ingest_logs(
    State(state): State<IngestState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.token.is_empty() && !valid_bearer(&headers, &state.token) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    let text = match decode_body(&headers, &body) {
        Ok(text) => text,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let parsed = parse_events(&text);
    let mut errors = parsed.errors;
    if parsed.events.is_empty() {
        let resp = IngestResponse {
            accepted: 0,
            rejected: errors.len(),
            errors: truncate_errors(errors),
        };
        return (StatusCode::BAD_REQUEST, axum::Json(resp)).into_response();
    }

    let received_at = Utc::now();
    let mut rows = Vec::with_capacity(parsed.events.len());
    let mut times = Vec::with_capacity(parsed.events.len());
    let mut rejected = errors.len();
    for (i, (event, raw)) in parsed.events.iter().enumerate() {
        match event.to_raw(raw, received_at) {
            Ok((row, ts)) => {
                rows.push(row);
                times.push(ts);
            }
            Err(e) => {
                rejected += 1;
                if errors.len() < MAX_REPORTED_ERRORS {
                    errors.push(IngestError {
                        line: i + 1,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    let mut accepted = 0;
    if !rows.is_empty() {
        // Raw logs land before the ack; a store failure must not mutate the
        // reconstructor either.
        if let Err(e) = state.store.insert_json_each_row("raw_logs", &rows).await {
            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
        }
        state.recon.add(&rows, &times).await;
        accepted = rows.len();
    }

    debug!(accepted, rejected, "ingested batch");
    let resp = IngestResponse {
        accepted,
        rejected,
        errors: truncate_errors(errors),
    };
    (StatusCode::OK, axum::Json(resp)).into_response()
}

fn truncate_errors(mut errors: Vec<IngestError>) -> Vec<IngestError> {
    errors.truncate(MAX_REPORTED_ERRORS);
    errors
}

fn decode_body(headers: &HeaderMap, body: &[u8]) -> Result<String, TraceLiteError> {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let bytes = if encoding.eq_ignore_ascii_case("gzip") {
        let mut out = Vec::new();
        let mut decoder = GzDecoder::new(body).take(MAX_BODY_BYTES as u64);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| TraceLiteError::Validation(format!("invalid gzip: {e}")))?;
        out
    } else {
        body[..body.len().min(MAX_BODY_BYTES)].to_vec()
    };

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn valid_bearer(headers: &HeaderMap, token: &str) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some((scheme, rest)) = value.split_once(' ') else {
        return false;
    };
    scheme.eq_ignore_ascii_case("bearer") && rest.trim() == token
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use axum::http::HeaderValue;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn auth_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert!(valid_bearer(&auth_headers("Bearer secret"), "secret"));
        assert!(valid_bearer(&auth_headers("bearer secret"), "secret"));
        assert!(valid_bearer(&auth_headers("BEARER secret "), "secret"));
        assert!(!valid_bearer(&auth_headers("Bearer wrong"), "secret"));
        assert!(!valid_bearer(&auth_headers("Basic secret"), "secret"));
        assert!(!valid_bearer(&auth_headers("secret"), "secret"));
        assert!(!valid_bearer(&HeaderMap::new(), "secret"));
    }

    #[test]
    fn decodes_gzip_bodies() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"correlationId\":\"c1\"}").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let text = decode_body(&headers, &compressed).unwrap();
        assert_eq!(text, "{\"correlationId\":\"c1\"}");
    }

    #[test]
    fn rejects_invalid_gzip() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let err = decode_body(&headers, b"definitely not gzip").unwrap_err();
        assert!(err.to_string().contains("invalid gzip"));
    }

    #[test]
    fn plain_bodies_pass_through() {
        let text = decode_body(&HeaderMap::new(), b"{\"a\":1}").unwrap();
        assert_eq!(text, "{\"a\":1}");
    }

    #[test]
    fn error_list_is_capped() {
        let errors: Vec<IngestError> = (0..250)
            .map(|i| IngestError {
                line: i,
                reason: "bad".to_string(),
            })
            .collect();
        assert_eq!(truncate_errors(errors).len(), MAX_REPORTED_ERRORS);
    }
}
