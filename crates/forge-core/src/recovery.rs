//! Best-effort recovery of JSON records from model output.
//!
//! Backends rarely return the clean JSON array they were asked for: output
//! arrives fenced in markdown, wrapped under an arbitrary key, as a single
//! bare object, or as several objects concatenated with no separator. This
//! module extracts whatever records can be salvaged and only fails when
//! nothing usable exists anywhere in the text.
//!
//! The extraction pipeline:
//! 1. direct parse (array, wrapper-key unwrap, single-record wrap,
//!    one-level recursion into nested objects)
//! 2. character-scanning state machine over concatenated objects
//! 3. coarse line-by-line brace counting
//! 4. [`ForgeError::InvalidFormat`] carrying an excerpt and a dump path

use crate::error::{ForgeError, ForgeResult};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Keys a backend may wrap the real array under when forced to return a
/// single JSON object.
const WRAPPER_KEYS: &[&str] = &[
    "response",
    "data",
    "result",
    "results",
    "test_cases",
    "tests",
    "cases",
    "items",
    "records",
];

/// Keys whose presence marks an object as a plausible test-data record.
const RECORD_KEYS: &[&str] = &[
    "id",
    "name",
    "case_name",
    "test_name",
    "description",
    "input",
    "expected",
    "method",
    "path",
];

/// Maximum excerpt length carried inside an `InvalidFormat` error.
const EXCERPT_CHARS: usize = 200;

/// Extract JSON records from arbitrary model output.
///
/// # Errors
/// Returns [`ForgeError::InvalidFormat`] when no record can be recovered by
/// any method; the error carries a bounded prefix of the text and, when the
/// dump could be written, a path to the full raw response.
pub fn extract_records(raw: &str) -> ForgeResult<Vec<Value>> {
    let cleaned = strip_fences(raw);

    match serde_json::from_str::<Value>(cleaned) {
        Ok(value) => {
            if let Some(records) = records_from_value(value, 0) {
                return Ok(records);
            }
            debug!("direct parse succeeded but no records found; scanning");
        }
        Err(error) => {
            debug!(error = %error, "direct parse failed; scanning");
        }
    }

    // Steps 2 and 3 are best-effort: they never fail, they only come back empty.
    let scanned = scan_concatenated(cleaned);
    if !scanned.is_empty() {
        return Ok(scanned);
    }

    let lines = scan_lines(cleaned);
    if !lines.is_empty() {
        return Ok(lines);
    }

    let mut error = ForgeError::invalid_format(
        "no JSON records found in response",
        Some(excerpt(raw)),
    );
    if let Some(path) = persist_dump(raw) {
        error = error.with_dump_path(path);
    }
    Err(error)
}

/// Whether an object carries at least one record-indicator key.
#[must_use]
pub fn looks_like_record(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| RECORD_KEYS.iter().any(|key| map.contains_key(*key)))
}

/// Bounded prefix of the offending text for diagnostics.
#[must_use]
pub fn excerpt(raw: &str) -> String {
    let prefix: String = raw.chars().take(EXCERPT_CHARS).collect();
    if raw.chars().count() > EXCERPT_CHARS {
        format!("{prefix}...")
    } else {
        prefix
    }
}

/// Strip a surrounding markdown code fence, if present.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", ...) on the opening fence line.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Interpret an already-parsed value as a list of records.
///
/// Recurses one level into nested object values before giving up.
fn records_from_value(value: Value, depth: u8) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(map) => {
            for key in WRAPPER_KEYS {
                if let Some(Value::Array(items)) = map.get(*key) {
                    return Some(items.clone());
                }
            }
            let object = Value::Object(map);
            if looks_like_record(&object) {
                return Some(vec![object]);
            }
            if depth == 0 {
                if let Value::Object(map) = object {
                    for (_, nested) in map {
                        if nested.is_object() {
                            if let Some(records) = records_from_value(nested, 1) {
                                return Some(records);
                            }
                        }
                    }
                }
            }
            None
        }
        _ => None,
    }
}

/// Scanner state for [`scan_concatenated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Between top-level objects.
    Outside,
    /// Inside an object at some brace depth.
    InObject,
    /// Inside a string literal (string delimiters never count toward depth).
    InString,
    /// The next character is escaped.
    Escaped,
}

/// Extract back-to-back top-level objects with a brace/string/escape state
/// machine. Each span where the depth returns to zero is a candidate record;
/// candidates that fail to parse or carry no record-indicator key are
/// discarded. Never fails on malformed input.
fn scan_concatenated(raw: &str) -> Vec<Value> {
    let mut records = Vec::new();
    let mut state = ScanState::Outside;
    let mut depth: u32 = 0;
    let mut span_start: Option<usize> = None;

    for (index, ch) in raw.char_indices() {
        match state {
            ScanState::Escaped => state = ScanState::InString,
            ScanState::InString => match ch {
                '\\' => state = ScanState::Escaped,
                '"' => {
                    state = if depth > 0 {
                        ScanState::InObject
                    } else {
                        ScanState::Outside
                    };
                }
                _ => {}
            },
            ScanState::Outside => match ch {
                '{' => {
                    depth = 1;
                    span_start = Some(index);
                    state = ScanState::InObject;
                }
                '"' => state = ScanState::InString,
                _ => {}
            },
            ScanState::InObject => match ch {
                '"' => state = ScanState::InString,
                '{' => depth += 1,
                '}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        if let Some(start) = span_start.take() {
                            let candidate = &raw[start..=index];
                            match serde_json::from_str::<Value>(candidate) {
                                Ok(value) if looks_like_record(&value) => records.push(value),
                                Ok(_) => {
                                    debug!("discarding candidate without record keys");
                                }
                                Err(error) => {
                                    debug!(error = %error, "discarding unparseable candidate");
                                }
                            }
                        }
                        state = ScanState::Outside;
                    }
                }
                _ => {}
            },
        }
    }

    if span_start.is_some() {
        warn!("response ended inside an unterminated JSON object");
    }
    records
}

/// Coarse line-by-line brace-counting pass, the last resort before failing.
///
/// Accumulates lines while the naive brace balance is positive and tries to
/// parse each balanced chunk. Strings containing braces can fool the balance,
/// which is acceptable here: anything this pass misparses simply fails the
/// parse step and is dropped.
fn scan_lines(raw: &str) -> Vec<Value> {
    let mut records = Vec::new();
    let mut buffer = String::new();
    let mut balance: i64 = 0;

    for line in raw.lines() {
        let opens = line.matches('{').count() as i64;
        let closes = line.matches('}').count() as i64;

        if balance == 0 && opens == 0 {
            continue;
        }
        buffer.push_str(line);
        buffer.push('\n');
        balance += opens - closes;

        if balance <= 0 {
            if let Ok(value) = serde_json::from_str::<Value>(buffer.trim()) {
                if looks_like_record(&value) {
                    records.push(value);
                }
            }
            buffer.clear();
            balance = 0;
        }
    }
    records
}

/// Persist the unrecoverable raw response for offline debugging.
///
/// Best effort: returns `None` when the dump cannot be written.
fn persist_dump(raw: &str) -> Option<PathBuf> {
    let path = std::env::temp_dir().join(format!("forge-response-{}.txt", uuid::Uuid::new_v4()));
    match std::fs::write(&path, raw) {
        Ok(()) => Some(path),
        Err(error) => {
            warn!(error = %error, "failed to persist raw-response dump");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_array() {
        let records = extract_records(r#"[{"id": 1}, {"id": 2}]"#).expect("recover");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], json!({"id": 1}));
    }

    #[test]
    fn test_wrapper_key_unwrap() {
        let records = extract_records(r#"{"data": [{"id": 1}]}"#).expect("recover");
        assert_eq!(records, vec![json!({"id": 1})]);
    }

    #[test]
    fn test_first_matching_wrapper_key_wins() {
        let records =
            extract_records(r#"{"response": [{"id": 1}], "data": [{"id": 2}]}"#).expect("recover");
        assert_eq!(records, vec![json!({"id": 1})]);
    }

    #[test]
    fn test_single_record_object_wrapped() {
        let records = extract_records(r#"{"name": "create user", "input": {}}"#).expect("recover");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["name"], "create user");
    }

    #[test]
    fn test_nested_one_level() {
        let records =
            extract_records(r#"{"payload": {"test_cases": [{"id": 9}]}}"#).expect("recover");
        assert_eq!(records, vec![json!({"id": 9})]);
    }

    #[test]
    fn test_concatenated_objects_in_order() {
        let records =
            extract_records(r#"{"id":1,"name":"a"}{"id":2,"name":"b"}"#).expect("recover");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["id"], 1);
        assert_eq!(records[1]["id"], 2);
    }

    #[test]
    fn test_concatenated_objects_with_noise_between() {
        let raw = "here you go: {\"id\":1} and another {\"id\":2} done";
        let records = extract_records(raw).expect("recover");
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_braces_inside_strings_do_not_split_objects() {
        let raw = r#"{"id": 1, "name": "weird {brace} value"}{"id": 2, "name": "also \"quoted\""}"#;
        let records = extract_records(raw).expect("recover");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["name"], "weird {brace} value");
    }

    #[test]
    fn test_candidates_without_record_keys_discarded() {
        let raw = r#"{"unrelated": true}{"id": 3, "name": "kept"}"#;
        let records = extract_records(raw).expect("recover");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["id"], 3);
    }

    #[test]
    fn test_markdown_fence_stripped() {
        let raw = "```json\n[{\"id\": 1}]\n```";
        let records = extract_records(raw).expect("recover");
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_pretty_printed_objects_via_line_scan() {
        let raw = "note:\n{\n  \"id\": 1,\n  \"name\": \"a\"\n}\ntrailing";
        let records = extract_records(raw).expect("recover");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["name"], "a");
    }

    #[test]
    fn test_not_json_fails_with_excerpt() {
        let error = extract_records("not json at all").expect_err("must fail");
        match error {
            ForgeError::InvalidFormat { excerpt, .. } => {
                assert!(excerpt.expect("excerpt").starts_with("not json at all"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_truncated_object_fails_without_panicking() {
        let error = extract_records(r#"{"id": 1, "name": "unterminated"#).expect_err("must fail");
        assert!(matches!(error, ForgeError::InvalidFormat { .. }));
    }

    #[test]
    fn test_excerpt_is_bounded() {
        let long = "x".repeat(1000);
        let prefix = excerpt(&long);
        assert!(prefix.chars().count() <= EXCERPT_CHARS + 3);
        assert!(prefix.ends_with("..."));
    }

    #[test]
    fn test_empty_input_fails() {
        assert!(extract_records("").is_err());
        assert!(extract_records("   \n  ").is_err());
    }
}
