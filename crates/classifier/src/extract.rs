//! Recovery of structured payloads from free-form model text.
//!
//! Models rarely answer with bare JSON; they wrap it in prose, fences, or
//! both. Extraction tries, in order: the whole trimmed text, the first
//! fenced block, then every top-level balanced bracketed region left to
//! right. The first candidate that parses *and* passes shape validation
//! wins. Pure and deterministic; no I/O.

use crate::error::ExtractError;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

const PREVIEW_LEN: usize = 120;

/// Shape a caller expects for its request kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedShape {
    /// A JSON object carrying at least these fields.
    Object { required: &'static [&'static str] },
    /// A JSON array.
    Array,
}

impl ExpectedShape {
    fn name(&self) -> &'static str {
        match self {
            ExpectedShape::Object { .. } => "object",
            ExpectedShape::Array => "array",
        }
    }
}

/// Validate a parsed value against the expected shape.
///
/// Returns the missing required fields on mismatch; a wrong top-level type
/// reports all required fields as missing.
pub fn validate_shape(value: &Value, shape: &ExpectedShape) -> Result<(), Vec<String>> {
    match shape {
        ExpectedShape::Object { required } => match value.as_object() {
            Some(map) => {
                let missing: Vec<String> = required
                    .iter()
                    .filter(|f| !map.contains_key(**f))
                    .map(|f| (*f).to_string())
                    .collect();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(missing)
                }
            }
            None => Err(required.iter().map(|f| (*f).to_string()).collect()),
        },
        ExpectedShape::Array => {
            if value.is_array() {
                Ok(())
            } else {
                Err(vec!["<array>".to_string()])
            }
        }
    }
}

/// Extract a structured payload of the expected shape from raw model text.
pub fn extract(raw: &str, shape: &ExpectedShape) -> Result<Value, ExtractError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ExtractError::NoPayload {
            preview: String::new(),
        });
    }

    let mut last_missing: Vec<String> = Vec::new();
    let mut saw_candidate = false;

    for candidate in candidates(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
            saw_candidate = true;
            match validate_shape(&value, shape) {
                Ok(()) => return Ok(value),
                Err(missing) => last_missing = missing,
            }
        }
    }

    let preview = truncate(trimmed, PREVIEW_LEN);
    if saw_candidate {
        Err(ExtractError::ShapeMismatch {
            expected: shape.name(),
            missing: last_missing,
            preview,
        })
    } else {
        Err(ExtractError::NoPayload { preview })
    }
}

/// Candidate payload strings in strategy order.
fn candidates(trimmed: &str) -> Vec<String> {
    let mut out = Vec::new();
    // 1. The whole text, as-is.
    out.push(trimmed.to_string());
    // 2. Explicitly fenced blocks.
    for block in fenced_blocks(trimmed) {
        out.push(block);
    }
    // 3. Top-level balanced bracketed regions, left to right.
    for region in balanced_regions(trimmed) {
        out.push(region);
    }
    out
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)```").expect("static regex")
    })
}

fn fenced_blocks(text: &str) -> Vec<String> {
    fence_re()
        .captures_iter(text)
        .map(|cap| cap[1].trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Scan for top-level balanced `{...}` / `[...]` regions, tracking nested
/// delimiters and ignoring delimiters inside quoted strings (escape-aware).
fn balanced_regions(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut regions = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let open = bytes[i];
        if open != b'{' && open != b'[' {
            i += 1;
            continue;
        }
        match scan_balanced(bytes, i) {
            Some(end) => {
                regions.push(text[i..=end].to_string());
                i = end + 1;
            }
            // Unbalanced from this opener; skip it and keep scanning.
            None => i += 1,
        }
    }
    regions
}

/// Find the index of the delimiter closing the region opened at `start`.
fn scan_balanced(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const OBJ_A: ExpectedShape = ExpectedShape::Object { required: &["a"] };

    #[test]
    fn parses_bare_json_directly() {
        let value = extract(r#"  {"a": 1}  "#, &OBJ_A).expect("extract");
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn recovers_json_embedded_in_prose() {
        let raw = r#"Sure, here is the result: {"a":1} — hope that helps!"#;
        let value = extract(raw, &OBJ_A).expect("extract");
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn prefers_fenced_block_over_later_regions() {
        let raw = "Answer below.\n```json\n{\"a\": 2}\n```\nIgnore {\"b\": 3}.";
        let value = extract(raw, &OBJ_A).expect("extract");
        assert_eq!(value, json!({"a": 2}));
    }

    #[test]
    fn skips_non_matching_regions_left_to_right() {
        let raw = r#"First {"b": 1} then {"a": 4} done."#;
        let value = extract(raw, &OBJ_A).expect("extract");
        assert_eq!(value, json!({"a": 4}));
    }

    #[test]
    fn ignores_brackets_inside_quoted_strings() {
        let raw = r#"note: {"a": "closing } inside", "b": "esc \" and {"} trailing"#;
        let value = extract(raw, &OBJ_A).expect("extract");
        assert_eq!(value["a"], json!("closing } inside"));
    }

    #[test]
    fn empty_input_fails_with_diagnostic() {
        let err = extract("", &OBJ_A).unwrap_err();
        assert!(matches!(err, ExtractError::NoPayload { .. }));
    }

    #[test]
    fn unbalanced_brackets_fail_without_panic() {
        let err = extract("here we go: {\"a\": [1, 2", &OBJ_A).unwrap_err();
        match err {
            ExtractError::NoPayload { preview } => {
                assert!(preview.contains("here we go"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn shape_mismatch_reports_missing_fields() {
        let err = extract(r#"{"b": 1}"#, &OBJ_A).unwrap_err();
        match err {
            ExtractError::ShapeMismatch { missing, .. } => {
                assert_eq!(missing, vec!["a".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn array_shape_accepts_arrays_only() {
        assert!(extract("[1, 2, 3]", &ExpectedShape::Array).is_ok());
        assert!(extract(r#"{"a": 1}"#, &ExpectedShape::Array).is_err());
    }

    #[test]
    fn extraction_is_deterministic() {
        let raw = r#"maybe {"a": 1} or {"a": 2}"#;
        let first = extract(raw, &OBJ_A).expect("extract");
        for _ in 0..10 {
            assert_eq!(extract(raw, &OBJ_A).expect("extract"), first);
        }
    }
}
