//! Model text → [`ModelAction`].
//!
//! The model answers in one of several shapes: the pseudo-call grammar
//! (`do(action="Tap", element=[x,y])`), `{"_metadata": …}` JSON, either of
//! those wrapped in `<think>/<answer>` tags, or plain prose. Decoding first
//! isolates a candidate, then runs an ordered chain of recovery strategies
//! over it (see [`crate::action::repair`]); the first one that produces an
//! object wins. The object is then validated into a closed [`Action`].
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::action::repair;
use crate::action::types::{Action, ModelAction, ModelPoint};

const FINISH_MARKER: &str = "finish(message=";
const DO_MARKER: &str = "do(action=";
const ANSWER_OPEN: &str = "<answer>";
const ANSWER_CLOSE: &str = "</answer>";
const REASONING_TAGS: [&str; 6] = [
    "<think>",
    "</think>",
    "<thinking>",
    "</thinking>",
    "<redacted_reasoning>",
    "</redacted_reasoning>",
];
const SNIPPET_CHARS: usize = 200;
const DEFAULT_FINISH_MESSAGE: &str = "Task completed";
const DEFAULT_WAIT: Duration = Duration::from_secs(1);
const MAX_WAIT: Duration = Duration::from_secs(600);

static CALL_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(do|finish)\s*\(").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum DecodeError {
    #[error("no action found in response: {0}")]
    Unrecognized(String),

    #[error("response JSON is not an object: {0}")]
    NotAnObject(String),

    #[error("action markup could not be parsed: {0}")]
    Malformed(String),

    #[error("unknown response kind '{0}' (expected do or finish)")]
    UnknownKind(String),

    #[error("unsupported action '{0}'")]
    UnsupportedAction(String),

    #[error("{action} is missing required field '{field}'")]
    MissingField { action: String, field: &'static str },

    #[error("{action} has an invalid '{field}': {reason}")]
    InvalidField {
        action: String,
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Verbs that, followed by an app name in free prose, are read as a
    /// Launch when nothing structured is present.
    #[serde(default = "default_launch_verbs")]
    pub launch_verbs: Vec<String>,
}

fn default_launch_verbs() -> Vec<String> {
    ["打开", "启动", "运行", "launch"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            launch_verbs: default_launch_verbs(),
        }
    }
}

/// Where the candidate action text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Marker,
    AnswerTag,
    WholeText,
}

/// A response separated into commentary and the action candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseParts {
    pub thinking: String,
    pub candidate: String,
    pub source: CandidateSource,
}

/// Full decode result: the commentary, the text the action was read from,
/// and the action itself.
#[derive(Debug, Clone)]
pub struct DecodedResponse {
    pub thinking: String,
    pub action_text: String,
    pub action: Result<ModelAction, DecodeError>,
}

pub struct ActionDecoder {
    launch_pattern: Option<Regex>,
}

impl Default for ActionDecoder {
    fn default() -> Self {
        Self::new(&DecoderConfig::default())
    }
}

impl ActionDecoder {
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            launch_pattern: repair::launch_pattern(&config.launch_verbs),
        }
    }

    pub fn decode(&self, raw: &str) -> Result<ModelAction, DecodeError> {
        self.decode_response(raw).action
    }

    pub fn decode_response(&self, raw: &str) -> DecodedResponse {
        let parts = split_response(raw);

        let candidate = if looks_structured(&parts.candidate) {
            parts.candidate.clone()
        } else if let Some(call) = repair::find_call(raw) {
            call.to_string()
        } else if let Some(obj) = repair::first_json_object(raw) {
            obj.to_string()
        } else {
            parts.candidate.clone()
        };

        let action = self
            .recover_object(&candidate, raw, parts.source != CandidateSource::WholeText)
            .and_then(|obj| classify(&obj));

        match &action {
            Ok(a) => tracing::debug!(action = a.name(), "response decoded"),
            Err(e) => tracing::debug!(error = %e, "response could not be decoded"),
        }

        DecodedResponse {
            thinking: parts.thinking,
            action_text: candidate,
            action,
        }
    }

    /// strict JSON → lenient JSON → call-syntax repair → keyword heuristic.
    fn recover_object(
        &self,
        candidate: &str,
        raw: &str,
        had_markup: bool,
    ) -> Result<Map<String, Value>, DecodeError> {
        if let Some(v) = repair::strict_json(candidate) {
            return into_object(v);
        }
        if let Some(v) = repair::lenient_json(candidate) {
            return into_object(v);
        }
        if let Some(obj) = repair::find_call(candidate).and_then(repair::call_to_object) {
            return Ok(obj);
        }
        if let Some(app) = self
            .launch_pattern
            .as_ref()
            .and_then(|re| repair::launch_keyword(re, raw))
        {
            tracing::debug!(app = %app, "launch inferred from prose");
            let mut obj = Map::new();
            obj.insert("_metadata".into(), Value::String("do".into()));
            obj.insert("action".into(), Value::String("Launch".into()));
            obj.insert("app".into(), Value::String(app));
            return Ok(obj);
        }
        if had_markup || candidate.trim_start().starts_with('{') {
            return Err(DecodeError::Malformed(snippet(candidate)));
        }
        Err(DecodeError::Unrecognized(snippet(raw)))
    }
}

/// Separate commentary from the action candidate: marker split, then
/// answer-tag split, else the whole trimmed text.
pub fn split_response(raw: &str) -> ResponseParts {
    let (thinking, candidate, source) = if let Some(idx) = raw.find(FINISH_MARKER) {
        (&raw[..idx], &raw[idx..], CandidateSource::Marker)
    } else if let Some(idx) = raw.find(DO_MARKER) {
        (&raw[..idx], &raw[idx..], CandidateSource::Marker)
    } else if let Some(idx) = raw.find(ANSWER_OPEN) {
        (
            &raw[..idx],
            &raw[idx + ANSWER_OPEN.len()..],
            CandidateSource::AnswerTag,
        )
    } else {
        ("", raw, CandidateSource::WholeText)
    };

    ResponseParts {
        thinking: strip_reasoning_tags(thinking),
        candidate: candidate.replace(ANSWER_CLOSE, "").trim().to_string(),
        source,
    }
}

fn strip_reasoning_tags(text: &str) -> String {
    let mut out = text.replace(ANSWER_OPEN, "");
    for tag in REASONING_TAGS {
        out = out.replace(tag, "");
    }
    out.trim().to_string()
}

/// A call, or an object that parses on its own. `{…}` followed by prose is
/// not, and goes through the brace scan instead.
fn looks_structured(candidate: &str) -> bool {
    if CALL_PREFIX.is_match(candidate) {
        return true;
    }
    candidate.starts_with('{')
        && (repair::strict_json(candidate).is_some() || repair::lenient_json(candidate).is_some())
}

fn into_object(v: Value) -> Result<Map<String, Value>, DecodeError> {
    match v {
        Value::Object(map) => Ok(map),
        other => Err(DecodeError::NotAnObject(snippet(&other.to_string()))),
    }
}

fn snippet(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= SNIPPET_CHARS {
        trimmed.to_string()
    } else {
        let mut s: String = trimmed.chars().take(SNIPPET_CHARS).collect();
        s.push('…');
        s
    }
}

/// Validate an action object into an [`Action`].
pub fn classify(obj: &Map<String, Value>) -> Result<ModelAction, DecodeError> {
    let kind = match obj.get("_metadata").and_then(Value::as_str) {
        Some(k) => k.trim().to_lowercase(),
        None if obj.contains_key("action") => "do".to_string(),
        None => {
            return Err(DecodeError::MissingField {
                action: "response".into(),
                field: "_metadata",
            })
        }
    };

    match kind.as_str() {
        "finish" => Ok(Action::Finish {
            message: string_field(obj, "message").unwrap_or_else(|| DEFAULT_FINISH_MESSAGE.into()),
        }),
        "do" => classify_do(obj),
        other => Err(DecodeError::UnknownKind(other.to_string())),
    }
}

fn classify_do(obj: &Map<String, Value>) -> Result<ModelAction, DecodeError> {
    let name = string_field(obj, "action").ok_or(DecodeError::MissingField {
        action: "do".into(),
        field: "action",
    })?;
    let key: String = name
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect();

    let action = match key.as_str() {
        "launch" => Action::Launch {
            app: require_string(obj, &name, "app")?,
        },
        "tap" | "click" => {
            if let Some(point) = point_field(obj, &name, "element")? {
                Action::Tap {
                    point,
                    sensitive: obj.contains_key("message"),
                }
            } else if let Some(label) = string_field(obj, "text") {
                Action::TapLabel { label }
            } else {
                return Err(DecodeError::MissingField {
                    action: name,
                    field: "element",
                });
            }
        }
        "type" | "typename" => Action::Type {
            text: require_string(obj, &name, "text")?,
        },
        "swipe" => Action::Swipe {
            from: require_point(obj, &name, "start")?,
            to: require_point(obj, &name, "end")?,
        },
        "longpress" => Action::LongPress {
            point: require_point(obj, &name, "element")?,
        },
        "doubletap" => Action::DoubleTap {
            point: require_point(obj, &name, "element")?,
        },
        "wait" => Action::Wait {
            duration: match obj.get("duration") {
                None | Some(Value::Null) => DEFAULT_WAIT,
                Some(v) => parse_duration(v).map_err(|reason| DecodeError::InvalidField {
                    action: name.clone(),
                    field: "duration",
                    reason,
                })?,
            },
        },
        "back" => Action::Back,
        "home" => Action::Home,
        _ => return Err(DecodeError::UnsupportedAction(name)),
    };
    Ok(action)
}

fn string_field(obj: &Map<String, Value>, field: &str) -> Option<String> {
    match obj.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn require_string(
    obj: &Map<String, Value>,
    action: &str,
    field: &'static str,
) -> Result<String, DecodeError> {
    string_field(obj, field).ok_or_else(|| DecodeError::MissingField {
        action: action.to_string(),
        field,
    })
}

fn require_point(
    obj: &Map<String, Value>,
    action: &str,
    field: &'static str,
) -> Result<ModelPoint, DecodeError> {
    point_field(obj, action, field)?.ok_or_else(|| DecodeError::MissingField {
        action: action.to_string(),
        field,
    })
}

/// `[x, y]` (numbers or numeric strings, or the array as a string).
fn point_field(
    obj: &Map<String, Value>,
    action: &str,
    field: &'static str,
) -> Result<Option<ModelPoint>, DecodeError> {
    let invalid = |reason: String| DecodeError::InvalidField {
        action: action.to_string(),
        field,
        reason,
    };

    let value = match obj.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(v) => v,
            Err(_) => return Err(invalid(format!("expected [x, y], got \"{s}\""))),
        },
        Some(v) => v.clone(),
    };

    let Value::Array(items) = value else {
        return Err(invalid(format!("expected [x, y], got {value}")));
    };
    if items.len() < 2 {
        return Err(invalid(format!("expected 2 coordinates, got {}", items.len())));
    }
    let axis = |v: &Value| -> Option<f64> {
        match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    };
    match (axis(&items[0]), axis(&items[1])) {
        (Some(x), Some(y)) => Ok(Some(ModelPoint::new(x, y))),
        _ => Err(invalid("coordinates must be numeric".into())),
    }
}

/// `"3s"`, `"3 seconds"`, `"500ms"`, `"3秒"`, or a bare number of seconds.
fn parse_duration(v: &Value) -> Result<Duration, String> {
    let secs = match v {
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("bad number {n}"))?,
        Value::String(s) => {
            let s = s.trim().to_lowercase();
            if let Some(ms) = s.strip_suffix("ms") {
                ms.trim()
                    .parse::<f64>()
                    .map(|ms| ms / 1000.0)
                    .map_err(|_| format!("cannot read '{s}'"))?
            } else {
                let number = ["seconds", "second", "secs", "sec", "s", "秒"]
                    .iter()
                    .find_map(|suffix| s.strip_suffix(suffix))
                    .unwrap_or(&s);
                number
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| format!("cannot read '{s}'"))?
            }
        }
        other => return Err(format!("expected a duration, got {other}")),
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("{secs} is not a valid number of seconds"));
    }
    Ok(Duration::from_secs_f64(secs).min(MAX_WAIT))
}
