//! Tolerant extraction of JSON objects from free-form model output.
//!
//! Models wrap JSON in prose, code fences, or both. Extraction tries, in
//! order: the whole text, every fenced block, then every balanced
//! brace-delimited span. The first candidate that parses as an object wins.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static FENCED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```(?:json|JSON)?\s*([\s\S]*?)```").expect("fence pattern is valid")
});

pub fn extract_object(text: &str) -> Option<Map<String, Value>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Some(obj) = as_object(text) {
        return Some(obj);
    }

    for cap in FENCED.captures_iter(text) {
        if let Some(obj) = cap.get(1).and_then(|m| as_object(m.as_str().trim())) {
            return Some(obj);
        }
    }

    let mut from = 0;
    while let Some(offset) = text[from..].find('{') {
        let start = from + offset;
        if let Some(end) = balanced_end(&text[start..]) {
            if let Some(obj) = as_object(&text[start..start + end]) {
                return Some(obj);
            }
        }
        from = start + 1;
    }
    None
}

/// Read a number that may have arrived as a JSON number or a numeric string.
pub fn lenient_f32(value: Option<&Value>) -> Option<f32> {
    let v = match value? {
        Value::Number(n) => n.as_f64()? as f32,
        Value::String(s) => s.trim().parse::<f32>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

/// Read a non-blank string.
pub fn lenient_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn as_object(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}

/// Byte length of the brace-balanced prefix starting at `s[0] == '{'`.
/// Braces inside string literals are ignored.
fn balanced_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
