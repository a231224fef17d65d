//! Tolerant scalar coercions for store result rows. ClickHouse `FORMAT JSON`
//! emits 64-bit integers as JSON strings, so numeric columns arrive as
//! either kind.

use serde_json::Value;

pub fn to_string(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

pub fn to_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

pub fn to_u32(value: Option<&Value>) -> u32 {
    let f = to_f64(value);
    if f <= 0.0 {
        0
    } else if f >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        f.round() as u32
    }
}
