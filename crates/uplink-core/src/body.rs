//! Storage-endpoint response bodies.
//!
//! The storage query endpoint answers either with one JSON document or with
//! newline-delimited JSON (one `{"result": {...}}` envelope per line). This
//! module turns either form into a flat list of per-record results so that
//! one bad record never hides its siblings.

use serde_json::Value;
use thiserror::Error;

/// A single record in a response body that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct BodyError {
    /// 1-based line number within the body.
    pub line: usize,
    pub message: String,
}

/// Split a response body into records.
///
/// - A single JSON array yields its elements.
/// - A JSON object whose `result` is an array yields that array's elements.
/// - Any other single JSON document is one record.
/// - Otherwise the body is treated as NDJSON; each non-blank line is decoded
///   independently (and unwrapped by the same rules).
pub fn split_records(body: &str) -> Vec<Result<Value, BodyError>> {
    let text = body.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if let Ok(document) = serde_json::from_str::<Value>(text) {
        return unwrap_document(document).into_iter().map(Ok).collect();
    }

    let mut records = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(document) => records.extend(unwrap_document(document).into_iter().map(Ok)),
            Err(e) => records.push(Err(BodyError {
                line: idx + 1,
                message: e.to_string(),
            })),
        }
    }
    records
}

fn unwrap_document(document: Value) -> Vec<Value> {
    match document {
        Value::Array(items) => items,
        Value::Object(mut map) if matches!(map.get("result"), Some(Value::Array(_))) => {
            match map.remove("result") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            }
        }
        other => vec![other],
    }
}
