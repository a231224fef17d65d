use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracelite_core::error::{Result, TraceLiteError};

/// One result row from the store's `FORMAT JSON` output.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(serde::Deserialize)]
struct QueryResponse {
    #[serde(default)]
    data: Vec<Row>,
}

/// Thin transport over the ClickHouse HTTP interface. The database name is
/// injected per request; SQL composition belongs to the callers. No retries:
/// a failed insert or query surfaces as `Upstream` and the caller decides.
#[derive(Clone)]
pub struct Store {
    base_url: String,
    database: String,
    client: reqwest::Client,
}

impl Store {
    pub fn new(dsn: &str, database: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TraceLiteError::Upstream(format!("build http client: {e}")))?;
        Ok(Self {
            base_url: dsn.trim_end_matches('/').to_string(),
            database: database.to_string(),
            client,
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub async fn ping(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/ping", self.base_url))
            .send()
            .await
            .map_err(|e| TraceLiteError::Upstream(format!("clickhouse ping failed: {e}")))?;
        check_status("clickhouse ping failed", resp).await?;
        Ok(())
    }

    /// Writes rows as newline-delimited JSON via
    /// `INSERT INTO {db}.{table} FORMAT JSONEachRow`.
    pub async fn insert_json_each_row<T: Serialize>(&self, table: &str, rows: &[T]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for row in rows {
            let line = serde_json::to_string(row)
                .map_err(|e| TraceLiteError::Upstream(format!("encode {table} row: {e}")))?;
            body.push_str(&line);
            body.push('\n');
        }

        let statement = format!(
            "INSERT INTO {}.{} FORMAT JSONEachRow",
            self.database, table
        );
        let resp = self
            .client
            .post(format!("{}/", self.base_url))
            .query(&[("query", statement.as_str())])
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| TraceLiteError::Upstream(format!("clickhouse insert failed: {e}")))?;
        check_status("clickhouse insert failed", resp).await?;
        Ok(())
    }

    /// Runs a SELECT and returns the `data` rows of the JSON output.
    pub async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let statement = format!("{} FORMAT JSON", sql.trim().trim_end_matches(';'));
        let resp = self
            .client
            .post(format!("{}/", self.base_url))
            .query(&[("database", self.database.as_str())])
            .header("Content-Type", "text/plain")
            .body(statement)
            .send()
            .await
            .map_err(|e| TraceLiteError::Upstream(format!("query failed: {e}")))?;
        let resp = check_status("query failed", resp).await?;
        let out: QueryResponse = parse_json(resp).await?;
        Ok(out.data)
    }
}

async fn check_status(context: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let mut body = resp.text().await.unwrap_or_default();
    body.truncate(8192);
    Err(TraceLiteError::Upstream(format!(
        "{context}: {status} ({body})"
    )))
}

async fn parse_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    resp.json::<T>()
        .await
        .map_err(|e| TraceLiteError::Upstream(format!("decode store response: {e}")))
}
