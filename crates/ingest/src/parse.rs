use serde::Serialize;
use tracelite_core::event::IngestEvent;

/// Per-line rejection detail returned to the agent. Line 0 means the whole
/// body was unusable.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IngestError {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ParsedBatch {
    /// Parsed events paired with their original JSON text.
    pub events: Vec<(IngestEvent, String)>,
    pub errors: Vec<IngestError>,
}

/// Sniffs the body shape: a JSON array of events, newline-delimited events,
/// or a single event object. Each element parses independently so one bad
/// line never rejects the batch.
pub fn parse_events(body: &str) -> ParsedBatch {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return ParsedBatch {
            events: Vec::new(),
            errors: vec![IngestError {
                line: 0,
                reason: "empty body".to_string(),
            }],
        };
    }

    if trimmed.starts_with('[') {
        return parse_array(trimmed);
    }
    if trimmed.contains('\n') {
        return parse_lines(trimmed);
    }
    parse_single(trimmed)
}

fn parse_array(body: &str) -> ParsedBatch {
    let values: Vec<serde_json::Value> = match serde_json::from_str(body) {
        Ok(values) => values,
        Err(e) => {
            return ParsedBatch {
                events: Vec::new(),
                errors: vec![IngestError {
                    line: 0,
                    reason: e.to_string(),
                }],
            };
        }
    };

    let mut batch = ParsedBatch::default();
    for (i, value) in values.into_iter().enumerate() {
        let raw = value.to_string();
        match serde_json::from_value::<IngestEvent>(value) {
            Ok(event) => batch.events.push((event, raw)),
            Err(e) => batch.errors.push(IngestError {
                line: i + 1,
                reason: e.to_string(),
            }),
        }
    }
    batch
}

fn parse_lines(body: &str) -> ParsedBatch {
    let mut batch = ParsedBatch::default();
    for (i, line) in body.lines().enumerate() {
        let entry = line.trim();
        if entry.is_empty() {
            continue;
        }
        match serde_json::from_str::<IngestEvent>(entry) {
            Ok(event) => batch.events.push((event, entry.to_string())),
            Err(e) => batch.errors.push(IngestError {
                line: i + 1,
                reason: e.to_string(),
            }),
        }
    }
    batch
}

fn parse_single(body: &str) -> ParsedBatch {
    match serde_json::from_str::<IngestEvent>(body) {
        Ok(event) => ParsedBatch {
            events: vec![(event, body.to_string())],
            errors: Vec::new(),
        },
        Err(e) => ParsedBatch {
            events: Vec::new(),
            errors: vec![IngestError {
                line: 1,
                reason: e.to_string(),
            }],
        },
    }
}
