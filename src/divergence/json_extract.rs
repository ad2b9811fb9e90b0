//! Locate a JSON object inside free-form model output
//!
//! Models wrap structured answers in prose or code fences. Each `{` is tried
//! as a start position; the first balanced span that parses as an object wins.
//! Braces inside string literals are ignored. Only the first
//! `MAX_START_CANDIDATES` opening braces are tried, which keeps the scan linear
//! in the length of the output.

use serde::de::DeserializeOwned;
use tracing::debug;

/// Opening braces tried before giving up
pub const MAX_START_CANDIDATES: usize = 32;

/// End index (exclusive) of the balanced object starting at `start`
fn scan_object(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset + c.len_utf8());
                }
            }
            _ => {}
        }
    }

    None
}

/// First substring that is a complete JSON object
pub fn find_json_object(text: &str) -> Option<&str> {
    let found = text
        .match_indices('{')
        .take(MAX_START_CANDIDATES)
        .find_map(|(start, _)| {
            let end = scan_object(text, start)?;
            let candidate = &text[start..end];
            match serde_json::from_str::<serde_json::Value>(candidate) {
                Ok(serde_json::Value::Object(_)) => Some(candidate),
                _ => None,
            }
        });
    if found.is_none() {
        debug!("No JSON object in {} chars of output", text.len());
    }
    found
}

/// Extract and deserialize the first JSON object in `text`
pub fn extract_json_object<T: DeserializeOwned>(text: &str) -> Option<T> {
    find_json_object(text).and_then(|json| serde_json::from_str(json).ok())
}
