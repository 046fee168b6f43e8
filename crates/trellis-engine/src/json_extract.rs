//! Extraction of the first well-formed JSON value from generated text.

use regex::Regex;
use std::sync::OnceLock;

use trellis_core::value::Value;

fn fenced_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)```json\s*(.*?)```").unwrap())
}

fn fenced_any_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```\s*(.*?)```").unwrap())
}

/// Try hard to pull a JSON value out of a model response.
///
/// Strategy, in order: the whole text, a fenced ```json block, any fenced
/// block, then the first bracket-balanced `{...}`/`[...]` span. Returns the
/// parsed value or a short error description, never both.
pub fn extract_first_json(text: &str) -> (Option<Value>, Option<String>) {
    let raw = text.trim();
    if raw.is_empty() {
        return (None, Some("empty response".to_string()));
    }

    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return (Some(value), None);
    }

    if let Some(captures) = fenced_json_re().captures(raw) {
        let candidate = captures[1].trim();
        match serde_json::from_str::<Value>(candidate) {
            Ok(value) => return (Some(value), None),
            Err(e) => return (None, Some(format!("failed to parse fenced json: {e}"))),
        }
    }

    if let Some(captures) = fenced_any_re().captures(raw) {
        let candidate = captures[1].trim();
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            return (Some(value), None);
        }
    }

    if let Some(candidate) = first_balanced_span(raw) {
        match serde_json::from_str::<Value>(candidate) {
            Ok(value) => return (Some(value), None),
            Err(e) => return (None, Some(format!("failed to parse inline json: {e}"))),
        }
    }

    (None, Some("no valid JSON found".to_string()))
}

/// First `{...}` or `[...]` span with balanced brackets, string-aware.
fn first_balanced_span(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{' || b == b'[')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' | b'[' if !in_string => depth += 1,
            b'}' | b']' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whole_text_json() {
        let (value, error) = extract_first_json(r#"{"a": 1}"#);
        assert_eq!(value, Some(json!({"a": 1})));
        assert!(error.is_none());
    }

    #[test]
    fn fenced_json_block() {
        let text = "Here you go:\n```json\n{\"decision\": \"accept\"}\n```\nDone.";
        let (value, error) = extract_first_json(text);
        assert_eq!(value, Some(json!({"decision": "accept"})));
        assert!(error.is_none());
    }

    #[test]
    fn fenced_block_without_tag() {
        let text = "```\n[1, 2, 3]\n```";
        let (value, _) = extract_first_json(text);
        assert_eq!(value, Some(json!([1, 2, 3])));
    }

    #[test]
    fn inline_object_with_prose() {
        let text = "The result is {\"score\": 0.9, \"tags\": [\"a\"]} as requested.";
        let (value, _) = extract_first_json(text);
        assert_eq!(value, Some(json!({"score": 0.9, "tags": ["a"]})));
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scan() {
        let text = "note {\"msg\": \"use { and } freely\"} end";
        let (value, _) = extract_first_json(text);
        assert_eq!(value, Some(json!({"msg": "use { and } freely"})));
    }

    #[test]
    fn no_json_reports_error() {
        let (value, error) = extract_first_json("just words");
        assert!(value.is_none());
        assert!(error.unwrap().contains("no valid JSON"));
    }

    #[test]
    fn malformed_fenced_json_reports_error() {
        let (value, error) = extract_first_json("```json\n{broken\n```");
        assert!(value.is_none());
        assert!(error.unwrap().contains("fenced"));
    }
}
