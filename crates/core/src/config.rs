use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, TraceLiteError};

#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    pub addr: String,
    pub clickhouse_dsn: String,
    pub clickhouse_db: String,
    pub ingest_token: String,
    pub tls_auto_self_signed: bool,
    pub tls_cert_file: Option<String>,
    pub tls_key_file: Option<String>,
    pub trace_window: Duration,
    pub flush_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            addr: ":8443".to_string(),
            clickhouse_dsn: "http://localhost:8123".to_string(),
            clickhouse_db: "trace_lite".to_string(),
            ingest_token: String::new(),
            tls_auto_self_signed: true,
            tls_cert_file: None,
            tls_key_file: None,
            trace_window: Duration::from_secs(120),
            flush_interval: Duration::from_secs(10),
        }
    }
}

impl CollectorConfig {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("COLLECTOR_ADDR") {
            cfg.addr = v;
        }
        if let Ok(v) = env::var("CLICKHOUSE_DSN") {
            cfg.clickhouse_dsn = v;
        }
        if let Ok(v) = env::var("CLICKHOUSE_DB") {
            cfg.clickhouse_db = v;
        }
        if let Ok(v) = env::var("INGEST_TOKEN") {
            cfg.ingest_token = v;
        }
        if let Ok(v) = env::var("TLS_AUTO_SELF_SIGNED") {
            cfg.tls_auto_self_signed = parse_bool("TLS_AUTO_SELF_SIGNED", &v)?;
        }
        if let Ok(v) = env::var("TLS_CERT_FILE") {
            if !v.is_empty() {
                cfg.tls_cert_file = Some(v);
            }
        }
        if let Ok(v) = env::var("TLS_KEY_FILE") {
            if !v.is_empty() {
                cfg.tls_key_file = Some(v);
            }
        }
        if let Ok(v) = env::var("TRACE_WINDOW") {
            cfg.trace_window = parse_duration("TRACE_WINDOW", &v)?;
        }
        if let Ok(v) = env::var("FLUSH_INTERVAL") {
            cfg.flush_interval = parse_duration("FLUSH_INTERVAL", &v)?;
        }

        Ok(cfg)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    pub addr: String,
    pub clickhouse_dsn: String,
    pub clickhouse_db: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: ":8080".to_string(),
            clickhouse_dsn: "http://localhost:8123".to_string(),
            clickhouse_db: "trace_lite".to_string(),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("API_ADDR") {
            cfg.addr = v;
        }
        if let Ok(v) = env::var("CLICKHOUSE_DSN") {
            cfg.clickhouse_dsn = v;
        }
        if let Ok(v) = env::var("CLICKHOUSE_DB") {
            cfg.clickhouse_db = v;
        }

        Ok(cfg)
    }
}

/// Accepts both `:8443` (all interfaces, as the agent configs write it) and
/// a full `host:port`.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let candidate = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    candidate
        .parse()
        .map_err(|e| TraceLiteError::Config(format!("invalid listen addr {addr:?}: {e}")))
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| TraceLiteError::Config(format!("bad {key}: {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "off" => Ok(false),
        other => Err(TraceLiteError::Config(format!("bad {key}: {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_defaults() {
        let cfg = CollectorConfig::default();
        assert_eq!(cfg.addr, ":8443");
        assert_eq!(cfg.clickhouse_db, "trace_lite");
        assert_eq!(cfg.trace_window, Duration::from_secs(120));
        assert_eq!(cfg.flush_interval, Duration::from_secs(10));
        assert!(cfg.tls_auto_self_signed);
        assert!(cfg.ingest_token.is_empty());
    }

    #[test]
    fn api_defaults() {
        let cfg = ApiConfig::default();
        assert_eq!(cfg.addr, ":8080");
        assert_eq!(cfg.clickhouse_dsn, "http://localhost:8123");
    }

    #[test]
    fn listen_addr_accepts_bare_port() {
        assert_eq!(
            parse_listen_addr(":8443").unwrap(),
            "0.0.0.0:8443".parse().unwrap()
        );
        assert_eq!(
            parse_listen_addr("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse().unwrap()
        );
        assert!(parse_listen_addr("nope").is_err());
    }

    #[test]
    fn durations_and_bools_parse() {
        assert_eq!(parse_duration("X", "2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("X", "10s").unwrap(), Duration::from_secs(10));
        assert!(parse_duration("X", "soon").is_err());
        assert!(parse_bool("X", "true").unwrap());
        assert!(!parse_bool("X", "0").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }
}
