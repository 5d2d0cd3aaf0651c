//! `{{key}}` placeholder rendering over step inputs.
//!
//! Rendering walks the input value once and touches only string leaves.
//! Keys are dotted paths into the plan context (`{{fetch_result.body.url}}`).
//! A string that is exactly one placeholder is replaced by the looked-up
//! value itself, preserving its type; placeholders embedded in longer
//! strings are interpolated as text. An unresolved placeholder is left
//! literally in place — a miss is not a failure.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex"));

/// Resolve a dotted path against the context map.
///
/// The first segment selects a context key; remaining segments descend
/// into objects. Array indexing is intentionally unsupported.
fn lookup<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let root = segments.next()?;
    let mut current = context.get(root)?;
    for seg in segments {
        current = current.as_object()?.get(seg)?;
    }
    Some(current)
}

/// Textual form used when a placeholder is interpolated mid-string.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_string(s: &str, context: &Map<String, Value>) -> Value {
    // Whole-string placeholder: substitute the value itself, any type.
    if let Some(caps) = PLACEHOLDER.captures(s) {
        if caps.get(0).map(|m| m.as_str()) == Some(s) {
            let path = &caps[1];
            return match lookup(context, path) {
                Some(v) => v.clone(),
                None => Value::String(s.to_string()),
            };
        }
    }
    // Embedded placeholders: interpolate as text, leave misses literal.
    let replaced = PLACEHOLDER.replace_all(s, |caps: &regex::Captures<'_>| {
        match lookup(context, &caps[1]) {
            Some(v) => stringify(v),
            None => caps[0].to_string(),
        }
    });
    Value::String(replaced.into_owned())
}

/// Render every string leaf of `input` against `context`.
pub fn render(input: &Value, context: &Map<String, Value>) -> Value {
    match input {
        Value::String(s) => render_string(s, context),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn interpolates_into_longer_string() {
        let context = ctx(json!({"A_result": {"echoed": {"msg": "hi"}}}));
        let out = render(&json!({"msg": "{{A_result.echoed.msg}} world"}), &context);
        assert_eq!(out, json!({"msg": "hi world"}));
    }

    #[test]
    fn whole_string_placeholder_preserves_type() {
        let context = ctx(json!({"count": 3, "items": [1, 2]}));
        let out = render(&json!({"n": "{{count}}", "xs": "{{items}}"}), &context);
        assert_eq!(out, json!({"n": 3, "xs": [1, 2]}));
    }

    #[test]
    fn unresolved_placeholder_left_literal() {
        let context = ctx(json!({}));
        let out = render(&json!({"msg": "{{missing.key}} here"}), &context);
        assert_eq!(out, json!({"msg": "{{missing.key}} here"}));
        let out = render(&json!("{{missing}}"), &context);
        assert_eq!(out, json!("{{missing}}"));
    }

    #[test]
    fn walks_arrays_and_nested_objects() {
        let context = ctx(json!({"who": "ops"}));
        let out = render(
            &json!({"list": ["{{who}}", {"deep": "for {{who}}"}], "n": 7}),
            &context,
        );
        assert_eq!(out, json!({"list": ["ops", {"deep": "for ops"}], "n": 7}));
    }

    #[test]
    fn non_string_leaves_untouched() {
        let context = ctx(json!({"x": 1}));
        let input = json!({"flag": true, "n": 42, "none": null});
        assert_eq!(render(&input, &context), input);
    }

    #[test]
    fn mid_string_object_interpolates_as_json() {
        let context = ctx(json!({"obj": {"a": 1}}));
        let out = render(&json!("value: {{obj}}"), &context);
        assert_eq!(out, json!(r#"value: {"a":1}"#));
    }
}
