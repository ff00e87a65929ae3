//! Daemon config migration (spec.md §6, phase 2 of `MigrateAll`).
//!
//! The reference config is the literal object below. A recursive diff
//! keeps only keys present in the source that are *added* or *changed*
//! versus the reference; deletions are ignored. If the diff is
//! non-empty it is written to the destination engine's daemon config
//! path (JSON, 2-space indent, mode 0644) and the destination
//! docker-machine is restarted.

use serde::Serialize;
use serde_json::{json, Value};

use crate::migrate::error::{MigrateError, MigrateResult};

pub fn reference_config() -> Value {
    json!({
        "builder": {"gc": {"defaultKeepStorage": "20GB", "enabled": true}},
        "experimental": false,
        "features": {"buildkit": true}
    })
}

/// Recursive diff: for each key in `source`, keep it if it is absent
/// from `reference` or its value differs; recurse into nested objects
/// present in both. Keys present only in `reference` (i.e. a user who
/// cleared their config) are not carried forward — they fall back to
/// the reference defaults on the destination, per spec.md §6.
pub fn diff_against_reference(source: &Value) -> Value {
    diff(source, &reference_config())
}

fn diff(source: &Value, reference: &Value) -> Value {
    match (source, reference) {
        (Value::Object(source_map), Value::Object(reference_map)) => {
            let mut out = serde_json::Map::new();
            for (key, source_value) in source_map {
                match reference_map.get(key) {
                    None => {
                        out.insert(key.clone(), source_value.clone());
                    }
                    Some(reference_value) => {
                        if source_value.is_object() && reference_value.is_object() {
                            let nested = diff(source_value, reference_value);
                            if !nested.as_object().map(|m| m.is_empty()).unwrap_or(true) {
                                out.insert(key.clone(), nested);
                            }
                        } else if source_value != reference_value {
                            out.insert(key.clone(), source_value.clone());
                        }
                    }
                }
            }
            Value::Object(out)
        }
        _ => source.clone(),
    }
}

pub fn is_empty_diff(diff: &Value) -> bool {
    diff.as_object().map(|m| m.is_empty()).unwrap_or(false)
}

/// Serialize a non-empty diff as 2-space-indented JSON, per spec.md §6.
pub fn render(diff: &Value) -> MigrateResult<String> {
    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(
        &mut buf,
        serde_json::ser::PrettyFormatter::with_indent(b"  "),
    );
    diff.serialize(&mut serializer)
        .map_err(|e| MigrateError::DaemonConfig(e.to_string()))?;
    String::from_utf8(buf).map_err(|e| MigrateError::DaemonConfig(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_source_yields_empty_diff() {
        let diff = diff_against_reference(&reference_config());
        assert!(is_empty_diff(&diff));
    }

    #[test]
    fn added_key_is_kept() {
        let source = json!({"log-level": "debug"});
        let diff = diff_against_reference(&source);
        assert_eq!(diff, json!({"log-level": "debug"}));
    }

    #[test]
    fn changed_nested_key_is_kept_but_unchanged_siblings_are_not() {
        let source = json!({
            "builder": {"gc": {"defaultKeepStorage": "50GB", "enabled": true}},
            "experimental": false,
        });
        let diff = diff_against_reference(&source);
        assert_eq!(
            diff,
            json!({"builder": {"gc": {"defaultKeepStorage": "50GB"}}})
        );
    }

    #[test]
    fn cleared_key_is_not_carried_forward() {
        // Source lacks `features` entirely — reference default wins on
        // the destination, so the diff says nothing about it.
        let source = json!({"experimental": false});
        let diff = diff_against_reference(&source);
        assert!(diff.get("features").is_none());
    }

    #[test]
    fn diff_is_idempotent() {
        let source = json!({"log-level": "debug", "experimental": true});
        let first = diff_against_reference(&source);
        let second = diff_against_reference(&source);
        assert_eq!(first, second);
    }

    #[test]
    fn render_uses_two_space_indent() {
        let diff = json!({"log-level": "debug"});
        let rendered = render(&diff).unwrap();
        assert!(rendered.contains("  \"log-level\""));
    }
}
