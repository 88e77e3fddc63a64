//! Deterministic JSON canonicalization and record hashing.
//!
//! A record's hash must be identical no matter how the caller ordered the
//! keys of the `scope` payload, so hashing goes through a canonical rendering
//! first:
//!
//! - Object keys are sorted lexicographically (byte order)
//! - Array order is preserved
//! - No whitespace between tokens
//! - Strings use minimal escaping (only `"`, `\`, and control characters)
//! - Numbers are emitted through one fixed formatter
//!
//! [`record_hash`] hashes the canonical form of a record's content fields with
//! SHA-256 and renders the digest as 64 lowercase hex characters. The record's
//! own identifier is **not** part of the hash input; the server-assigned
//! `recorded_at` timestamp **is**, so a verifier needs the stored row, not
//! just the caller's original request.

use std::fmt::Write as _;

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

use crate::record::RecordContent;

/// Renders a JSON value in canonical form.
///
/// Two structurally-equal values (same keys and values, any insertion order)
/// always produce identical output.
#[must_use]
pub fn canonicalize(value: &Value) -> String {
    let mut output = String::new();
    emit_value(value, &mut output);
    output
}

/// Computes the canonical SHA-256 hash of a record's content fields.
///
/// The hash input excludes the record id and covers entity, action, scope,
/// the event timestamp, and the recorded-at timestamp.
#[must_use]
pub fn record_hash(content: &RecordContent) -> String {
    hash_value(&content.to_hash_input())
}

/// Canonicalizes an arbitrary JSON value and hashes it with SHA-256.
#[must_use]
pub fn hash_value(value: &Value) -> String {
    let canonical = canonicalize(value);
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

fn emit_value(value: &Value, output: &mut String) {
    match value {
        Value::Null => output.push_str("null"),
        Value::Bool(b) => output.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => emit_number(n, output),
        Value::String(s) => emit_string(s, output),
        Value::Array(arr) => emit_array(arr, output),
        Value::Object(obj) => emit_object(obj, output),
    }
}

/// Emits a number through `serde_json`'s formatter.
///
/// Integers print as plain decimals; floats use the shortest round-trip
/// representation. The formatter is the single fixed encoding for every hash
/// input, which is what determinism requires here.
fn emit_number(n: &Number, output: &mut String) {
    let _ = write!(output, "{n}");
}

/// Emits a string with minimal escaping.
///
/// Only the quotation mark, reverse solidus, and control characters
/// U+0000..=U+001F are escaped; control characters use the short escapes
/// where JSON defines them and `\uXXXX` otherwise.
fn emit_string(s: &str, output: &mut String) {
    output.push('"');
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\u{0008}' => output.push_str("\\b"),
            '\u{000C}' => output.push_str("\\f"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(output, "\\u{:04x}", c as u32);
            },
            c => output.push(c),
        }
    }
    output.push('"');
}

fn emit_array(arr: &[Value], output: &mut String) {
    output.push('[');
    for (i, item) in arr.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_value(item, output);
    }
    output.push(']');
}

fn emit_object(obj: &Map<String, Value>, output: &mut String) {
    let mut sorted_keys: Vec<&String> = obj.keys().collect();
    sorted_keys.sort();

    output.push('{');
    for (i, key) in sorted_keys.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_string(key, output);
        output.push(':');
        emit_value(&obj[*key], output);
    }
    output.push('}');
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::record::RecordContent;

    fn content(scope: Value) -> RecordContent {
        RecordContent {
            entity: "alice@example.com".to_string(),
            action: "approved".to_string(),
            scope,
            timestamp: "2026-01-15T10:00:00Z".to_string(),
            recorded_at: "2026-01-15T10:00:01Z".to_string(),
        }
    }

    #[test]
    fn sorts_object_keys() {
        let input = json!({"z": 1, "a": 2, "m": 3});
        assert_eq!(canonicalize(&input), r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn preserves_array_order() {
        let input = json!([3, 1, 2]);
        assert_eq!(canonicalize(&input), "[3,1,2]");
    }

    #[test]
    fn key_reorder_is_stable() {
        let a = json!({"outer": {"x": 1, "y": [true, null]}, "k": "v"});
        let b = json!({"k": "v", "outer": {"y": [true, null], "x": 1}});
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn escapes_special_characters() {
        let input = json!({"text": "line1\nline2\ttab \"quoted\""});
        assert_eq!(
            canonicalize(&input),
            r#"{"text":"line1\nline2\ttab \"quoted\""}"#
        );
    }

    #[test]
    fn primitives_have_fixed_encoding() {
        assert_eq!(canonicalize(&json!(null)), "null");
        assert_eq!(canonicalize(&json!(true)), "true");
        assert_eq!(canonicalize(&json!(42)), "42");
        assert_eq!(canonicalize(&json!(-7)), "-7");
    }

    #[test]
    fn record_hash_is_64_lowercase_hex() {
        let hash = record_hash(&content(json!({"case": "c-1"})));
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn record_hash_ignores_scope_key_order() {
        let a = record_hash(&content(json!({"case": "c-1", "verdict": "guilty"})));
        let b = record_hash(&content(json!({"verdict": "guilty", "case": "c-1"})));
        assert_eq!(a, b);
    }

    #[test]
    fn record_hash_is_sensitive_to_content() {
        let a = record_hash(&content(json!({"case": "c-1"})));
        let b = record_hash(&content(json!({"case": "c-2"})));
        assert_ne!(a, b);
    }

    #[test]
    fn record_hash_excludes_id() {
        // The hash input is derived solely from content fields; two records
        // with different ids but identical content must collide.
        let hash_a = record_hash(&content(json!({})));
        let hash_b = record_hash(&content(json!({})));
        assert_eq!(hash_a, hash_b);
        let input = content(json!({})).to_hash_input();
        assert!(input.get("id").is_none());
    }
}
