//! Text helpers for model output: sanitizing and pulling JSON out of prose.

use serde_json::Value;

const ELLIPSIS: char = '…';

/// Strip control characters (newline and tab survive), trim, and cap the
/// result at `max_chars` characters. Truncated text ends with `…`, which
/// counts toward the cap.
pub fn sanitize(text: &str, max_chars: usize) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    let trimmed = cleaned.trim();

    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }
    let mut out: String = trimmed.chars().take(max_chars - 1).collect();
    out.truncate(out.trim_end().len());
    out.push(ELLIPSIS);
    out
}

/// Find the first balanced JSON object or array in `text` that parses and
/// satisfies `accept`. Brackets inside strings are ignored.
pub fn find_json_value(text: &str, accept: impl Fn(&Value) -> bool) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(offset) = bytes[start..].iter().position(|b| *b == b'{' || *b == b'[') {
        let open = start + offset;
        if let Some(close) = balanced_end(bytes, open) {
            if let Ok(value) = serde_json::from_str::<Value>(&text[open..=close]) {
                if accept(&value) {
                    return Some(value);
                }
            }
        }
        start = open + 1;
    }
    None
}

fn balanced_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(b) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
