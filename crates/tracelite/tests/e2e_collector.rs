use std::io::Write;
use std::net::TcpListener as StdTcpListener;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use flate2::Compression;
use flate2::write::GzEncoder;
use serial_test::serial;
use tracelite_testkit::sample_trace_ndjson;

type Captured = Arc<Mutex<Vec<(String, String)>>>;

fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_tracelite")
}

async fn capture_insert(
    State(state): State<Captured>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> &'static str {
    state.lock().unwrap().push((
        query.unwrap_or_default(),
        String::from_utf8_lossy(&body).to_string(),
    ));
    r#"{"data":[]}"#
}

/// Accepts every request like the ClickHouse HTTP interface would and records
/// (query string, body) pairs.
async fn mock_clickhouse() -> (String, Captured) {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .fallback(capture_insert)
        .with_state(captured.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), captured)
}

struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn spawn_collector(mock_url: &str, port: u16, token: &str) -> ChildGuard {
    let child = Command::new(bin())
        .arg("collector")
        .env("COLLECTOR_ADDR", format!("127.0.0.1:{port}"))
        .env("CLICKHOUSE_DSN", mock_url)
        .env("CLICKHOUSE_DB", "trace_lite")
        .env("INGEST_TOKEN", token)
        .env("TRACE_WINDOW", "1s")
        .env("FLUSH_INTERVAL", "200ms")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    ChildGuard(child)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap()
}

async fn wait_ready(port: u16, child: &mut ChildGuard) {
    let client = client();
    for _ in 0..100 {
        assert!(
            child.0.try_wait().unwrap().is_none(),
            "collector exited early"
        );
        if client
            .get(format!("https://127.0.0.1:{port}/v1/healthz"))
            .send()
            .await
            .is_ok()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("collector not ready");
}

fn gzip(data: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

fn captured_insert(captured: &Captured, table: &str) -> Option<String> {
    captured
        .lock()
        .unwrap()
        .iter()
        .find(|(query, _)| query.contains(&format!("trace_lite.{table}")))
        .map(|(_, body)| body.clone())
}

#[tokio::test]
#[serial]
async fn e2e_gzip_ndjson_ingest_and_flush() {
    let (mock_url, captured) = mock_clickhouse().await;
    let port = free_port();
    let mut child = spawn_collector(&mock_url, port, "secret");
    wait_ready(port, &mut child).await;

    let resp = client()
        .post(format!("https://127.0.0.1:{port}/v1/ingest/logs"))
        .header("Authorization", "Bearer secret")
        .header("Content-Encoding", "gzip")
        .body(gzip(&sample_trace_ndjson("trace-e2e")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["accepted"], 4);
    assert_eq!(body["rejected"], 0);

    // Raw logs are written before the ack.
    let raw_body = captured_insert(&captured, "raw_logs").expect("raw_logs insert");
    assert_eq!(raw_body.trim().lines().count(), 4);
    assert!(raw_body.contains("\"trace_id\":\"trace-e2e\""));

    // The 1s window plus the 200ms ticker flushes spans, traces, and edges.
    let mut flushed = false;
    for _ in 0..100 {
        if captured_insert(&captured, "dependency_edges_minute").is_some() {
            flushed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(flushed, "reconstructor never flushed");

    let spans_body = captured_insert(&captured, "spans").unwrap();
    assert!(spans_body.contains("\"span_id\":\"s1\""));
    assert!(spans_body.contains("\"span_id\":\"s2\""));
    assert!(spans_body.contains("\"parent_span_id\":\"s1\""));

    let traces_body = captured_insert(&captured, "traces").unwrap();
    assert!(traces_body.contains("\"trace_id\":\"trace-e2e\""));
    assert!(traces_body.contains("\"root_service\":\"svc-a\""));
    assert!(traces_body.contains("\"span_count\":2"));
    assert!(traces_body.contains("\"service_count\":2"));

    let edges_body = captured_insert(&captured, "dependency_edges_minute").unwrap();
    assert!(edges_body.contains("\"caller_service\":\"svc-a\""));
    assert!(edges_body.contains("\"callee_service\":\"svc-b\""));
    assert!(edges_body.contains("\"calls\":1"));
}

#[tokio::test]
#[serial]
async fn e2e_bearer_auth_is_enforced() {
    let (mock_url, _captured) = mock_clickhouse().await;
    let port = free_port();
    let mut child = spawn_collector(&mock_url, port, "secret");
    wait_ready(port, &mut child).await;

    let no_token = client()
        .post(format!("https://127.0.0.1:{port}/v1/ingest/logs"))
        .body(sample_trace_ndjson("trace-auth"))
        .send()
        .await
        .unwrap();
    assert_eq!(no_token.status(), 401);

    let wrong_token = client()
        .post(format!("https://127.0.0.1:{port}/v1/ingest/logs"))
        .header("Authorization", "Bearer nope")
        .body(sample_trace_ndjson("trace-auth"))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_token.status(), 401);

    let case_insensitive_scheme = client()
        .post(format!("https://127.0.0.1:{port}/v1/ingest/logs"))
        .header("Authorization", "bearer secret")
        .body(sample_trace_ndjson("trace-auth"))
        .send()
        .await
        .unwrap();
    assert_eq!(case_insensitive_scheme.status(), 200);
}

#[tokio::test]
#[serial]
async fn e2e_per_line_rejects_and_empty_body() {
    let (mock_url, _captured) = mock_clickhouse().await;
    let port = free_port();
    let mut child = spawn_collector(&mock_url, port, "");
    wait_ready(port, &mut child).await;

    let mixed = "{\"correlationId\":\"c1\"}\nnot json\n{\"timestamp\":\"bad\",\"correlationId\":\"c2\"}";
    let resp = client()
        .post(format!("https://127.0.0.1:{port}/v1/ingest/logs"))
        .body(mixed)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["accepted"], 1);
    assert_eq!(body["rejected"], 2);
    assert_eq!(body["errors"].as_array().unwrap().len(), 2);

    let empty = client()
        .post(format!("https://127.0.0.1:{port}/v1/ingest/logs"))
        .body("")
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), 400);

    let not_post = client()
        .get(format!("https://127.0.0.1:{port}/v1/ingest/logs"))
        .send()
        .await
        .unwrap();
    assert_eq!(not_post.status(), 405);
}
