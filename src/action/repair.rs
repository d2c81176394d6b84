//! Recovery strategies for model output that is not clean JSON.
//!
//! Each function is one named step of the decoder's fallback chain
//! (strict JSON → lenient JSON → call-syntax repair → keyword heuristic)
//! and is usable on its own.
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Number, Value};

static CALL_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(do|finish)\s*\(").expect("static regex"));

static PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(\w+)\s*=\s*("(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*'|\[[^\]]*\]|-?\d+(?:\.\d+)?|(?i:true|false))"#,
    )
    .expect("static regex")
});

static MESSAGE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)message\s*=\s*").expect("static regex"));

/// Parse with `serde_json` as-is.
pub fn strict_json(text: &str) -> Option<Value> {
    serde_json::from_str(text.trim()).ok()
}

/// Parse after rewriting common near-JSON into strict JSON.
/// Only attempted on text that opens like an object.
pub fn lenient_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(&relax_json(trimmed)).ok()
}

/// Rewrite single-quoted strings, bare keys, trailing commas and
/// `True/False/None` into their strict JSON forms.
pub fn relax_json(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' => {
                let quote = c;
                out.push('"');
                i += 1;
                while i < chars.len() {
                    let ch = chars[i];
                    if ch == '\\' && i + 1 < chars.len() {
                        let next = chars[i + 1];
                        if next == '\'' {
                            out.push('\'');
                        } else {
                            out.push('\\');
                            out.push(next);
                        }
                        i += 2;
                        continue;
                    }
                    if ch == quote {
                        break;
                    }
                    match ch {
                        '"' => out.push_str("\\\""),
                        '\n' => out.push_str("\\n"),
                        other => out.push(other),
                    }
                    i += 1;
                }
                out.push('"');
                i += 1;
            }
            ',' => {
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                    i += 1;
                    continue;
                }
                out.push(c);
                i += 1;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ':' {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else {
                    out.push_str(match word.as_str() {
                        "True" => "true",
                        "False" => "false",
                        "None" => "null",
                        w => w,
                    });
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// First `{…}` span (by brace depth, ignoring braces inside strings) that
/// parses as JSON, strictly or leniently.
pub fn first_json_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut start: Option<usize> = None;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' if start.is_some() => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        let candidate = &text[s..=idx];
                        if strict_json(candidate).is_some() || lenient_json(candidate).is_some() {
                            return Some(candidate);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Locate the first `do(...)` / `finish(...)` call and return it up to its
/// matching close paren. Quotes and brackets are respected; an unclosed call
/// runs to the end of the text.
pub fn find_call(text: &str) -> Option<&str> {
    let m = CALL_START.find(text)?;
    let open = m.end();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (offset, ch) in text[open..].char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '(' | '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ')' => {
                if depth == 0 {
                    return Some(&text[m.start()..open + offset + 1]);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    Some(text[m.start()..].trim_end())
}

/// Turn `name(key=value, ...)` into the equivalent discriminated object.
pub fn call_to_object(call: &str) -> Option<Map<String, Value>> {
    let caps = CALL_START.captures(call)?;
    let name = caps.get(1)?.as_str().to_lowercase();
    let open = caps.get(0)?.end();
    let mut params = &call[open..];
    if let Some(stripped) = params.trim_end().strip_suffix(')') {
        params = stripped;
    }

    let mut obj = Map::new();
    if name == "finish" {
        obj.insert("_metadata".into(), Value::String("finish".into()));
        obj.insert("message".into(), Value::String(finish_message(params)));
        return Some(obj);
    }

    obj.insert("_metadata".into(), Value::String("do".into()));
    for cap in PARAM.captures_iter(params) {
        let key = cap[1].to_string();
        let value = param_value(&cap[2]);
        obj.insert(key, value);
    }
    Some(obj)
}

/// Message of a `finish(...)` call. Tolerates broken quoting by falling back
/// to the raw parameter text.
fn finish_message(params: &str) -> String {
    let rest = match MESSAGE_KEY.find(params) {
        Some(m) => &params[m.end()..],
        None => params,
    };
    let rest = rest.trim();
    let mut chars = rest.chars();
    match chars.next() {
        Some(q @ ('"' | '\'')) => {
            let body = &rest[q.len_utf8()..];
            let inner = match body.rfind(q) {
                Some(end) => &body[..end],
                None => body,
            };
            unescape(inner)
        }
        _ => rest.trim_matches(|c| c == '"' || c == '\'').to_string(),
    }
}

fn param_value(raw: &str) -> Value {
    let raw = raw.trim();
    if raw.starts_with('"') || raw.starts_with('\'') {
        // PARAM only matches closed quotes, so both ends are ASCII quote bytes.
        let inner = &raw[1..raw.len() - 1];
        return Value::String(unescape(inner));
    }
    if raw.starts_with('[') {
        let inner = raw.trim_start_matches('[').trim_end_matches(']');
        let items = inner
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|item| match number_value(item) {
                Some(n) => n,
                None => Value::String(item.trim_matches(|c| c == '"' || c == '\'').to_string()),
            })
            .collect();
        return Value::Array(items);
    }
    if raw.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    number_value(raw).unwrap_or_else(|| Value::String(raw.to_string()))
}

fn number_value(raw: &str) -> Option<Value> {
    if let Ok(i) = raw.parse::<i64>() {
        return Some(Value::Number(i.into()));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn unescape(s: &str) -> String {
    s.replace("\\\"", "\"")
        .replace("\\'", "'")
        .replace("\\n", "\n")
        .replace("\\\\", "\\")
}

/// Build the "open an app" heuristic for prose like `打开QQ`.
pub fn launch_pattern(verbs: &[String]) -> Option<Regex> {
    let alternatives: Vec<String> = verbs
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(regex::escape)
        .collect();
    if alternatives.is_empty() {
        return None;
    }
    let pattern = format!(r"(?i)(?:{})\s*([^\s，,。.!！?？]+)", alternatives.join("|"));
    match Regex::new(&pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(error = %e, "invalid launch verb pattern, keyword fallback disabled");
            None
        }
    }
}

/// App named after the first launch verb, if any.
pub fn launch_keyword(pattern: &Regex, text: &str) -> Option<String> {
    pattern
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|app| !app.is_empty())
}
