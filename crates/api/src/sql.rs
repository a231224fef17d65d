use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

/// Everything interpolated into SQL must survive this whitelist; anything
/// else collapses to empty and the filter is omitted.
fn safe_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9._:/-]+$").expect("valid token pattern"))
}

pub fn sanitize(value: Option<&str>) -> String {
    let trimmed = value.unwrap_or_default().trim();
    if trimmed.is_empty() || !safe_token().is_match(trimmed) {
        return String::new();
    }
    trimmed.to_string()
}

/// Query window; defaults to the last hour and falls back to it when the
/// bounds are inverted.
pub fn parse_range(from: Option<&str>, to: Option<&str>) -> (DateTime<Utc>, DateTime<Utc>) {
    let mut upper = Utc::now();
    let mut lower = upper - Duration::hours(1);
    if let Some(raw) = to {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            upper = parsed.with_timezone(&Utc);
        }
    }
    if let Some(raw) = from {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            lower = parsed.with_timezone(&Utc);
        }
    }
    if lower >= upper {
        lower = upper - Duration::hours(1);
    }
    (lower, upper)
}

pub fn parse_limit(raw: Option<&str>, fallback: i64) -> i64 {
    let Some(raw) = raw else {
        return fallback;
    };
    match raw.parse::<i64>() {
        Ok(v) if v > 0 => v.min(5000),
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_accepts_identifier_charset() {
        assert_eq!(sanitize(Some("svc-a")), "svc-a");
        assert_eq!(sanitize(Some(" 1.2.3 ")), "1.2.3");
        assert_eq!(sanitize(Some("GET:/api/v1/orders")), "GET:/api/v1/orders");
    }

    #[test]
    fn sanitize_rejects_hostile_input() {
        assert_eq!(sanitize(Some("a' OR '1'='1")), "");
        assert_eq!(sanitize(Some("svc; DROP TABLE spans")), "");
        assert_eq!(sanitize(Some("a b")), "");
        assert_eq!(sanitize(Some("")), "");
        assert_eq!(sanitize(None), "");
    }

    #[test]
    fn range_defaults_to_last_hour() {
        let (from, to) = parse_range(None, None);
        assert_eq!(to - from, Duration::hours(1));
    }

    #[test]
    fn range_parses_rfc3339_bounds() {
        let (from, to) = parse_range(
            Some("2026-02-01T00:00:00Z"),
            Some("2026-02-01T02:00:00Z"),
        );
        assert_eq!(to - from, Duration::hours(2));
        assert_eq!(from.to_rfc3339(), "2026-02-01T00:00:00+00:00");
    }

    #[test]
    fn inverted_range_falls_back() {
        let (from, to) = parse_range(
            Some("2026-02-01T05:00:00Z"),
            Some("2026-02-01T02:00:00Z"),
        );
        assert_eq!(to - from, Duration::hours(1));
        assert_eq!(to.to_rfc3339(), "2026-02-01T02:00:00+00:00");
    }

    #[test]
    fn limits_clamp() {
        assert_eq!(parse_limit(None, 200), 200);
        assert_eq!(parse_limit(Some("50"), 200), 50);
        assert_eq!(parse_limit(Some("0"), 200), 200);
        assert_eq!(parse_limit(Some("-3"), 200), 200);
        assert_eq!(parse_limit(Some("9000"), 200), 5000);
        assert_eq!(parse_limit(Some("wat"), 200), 200);
    }
}
