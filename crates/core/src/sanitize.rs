use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static LINE_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:(?:#{1,6}|[-*•+>]|\d{1,3}[.)])(?:\s+|$))+").unwrap());

static EMPHASIS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*|__").unwrap());

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static SPACE_BEFORE_PUNCT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" +([.,;:!?])").unwrap());

static DANGLING_PUNCT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[:;,]+\.").unwrap());

static EMPTY_PARENS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(\s*\)").unwrap());

const SENTENCE_END: &[char] = &['.', '!', '?', ':', ';', ',', '…'];

/// Sanitize narration text: drop structural JSON, flatten markdown lines
/// into prose and tidy punctuation.
///
/// The result is a fixpoint: sanitizing it again returns it unchanged.
pub fn sanitize_narration(text: &str) -> String {
    let mut current = sanitize_pass(text);
    // Every pass after the first only shortens the text or turns a trailing
    // ':' into '.', so twice the length bounds the number of passes.
    for _ in 0..=2 * current.len() {
        let next = sanitize_pass(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn sanitize_pass(text: &str) -> String {
    let text = flatten_lines(&strip_json_blocks(text));
    let text = strip_markup(text);
    let text = WHITESPACE_RE.replace_all(&text, " ");
    let text = SPACE_BEFORE_PUNCT_RE.replace_all(&text, "$1");
    let text = DANGLING_PUNCT_RE.replace_all(&text, ".");
    let text = text.trim();
    match text.strip_suffix(':') {
        Some(stem) => format!("{}.", stem.trim_end()),
        None => text.to_string(),
    }
}

/// Remove emphasis markers and empty parentheses until none are left;
/// removing one can expose another (`(())`, `*()*`).
fn strip_markup(mut text: String) -> String {
    loop {
        let next = EMPTY_PARENS_RE.replace_all(&text, "").into_owned();
        let next = EMPHASIS_RE.replace_all(&next, "").into_owned();
        if next == text {
            return text;
        }
        text = next;
    }
}

/// Remove well-formed JSON objects, and arrays holding objects, from prose.
/// Ordinary bracketed prose such as `{name}` or `[1, 2]` is left alone.
fn strip_json_blocks(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if matches!(bytes[i], b'{' | b'[') {
            if let Some(end) = matching_close(bytes, i) {
                if is_structural_json(&text[i..=end]) {
                    out.push_str(&text[copied..i]);
                    out.push(' ');
                    copied = end + 1;
                }
                // Balanced blocks are consumed whole, valid or not.
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
    out.push_str(&text[copied..]);
    out
}

/// Byte index of the bracket closing the one at `start`, honouring JSON
/// string quoting and backslash escapes.
fn matching_close(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn is_structural_json(block: &str) -> bool {
    match serde_json::from_str::<Value>(block) {
        Ok(Value::Object(map)) => !map.is_empty(),
        Ok(Value::Array(items)) => items
            .iter()
            .any(|item| matches!(item, Value::Object(map) if !map.is_empty())),
        _ => false,
    }
}

fn flatten_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let line = LINE_MARKER_RE.replace(line.trim(), "");
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !out.is_empty() {
            if !out.ends_with(SENTENCE_END) {
                out.push('.');
            }
            out.push(' ');
        }
        out.push_str(line);
    }
    out
}
