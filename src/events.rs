//! Worker output parsing.
//!
//! Workers print newline-delimited JSON. Every line becomes an [`Event`],
//! including lines that are not JSON at all, so parsing never fails and the
//! raw text always survives for diagnostics.

use std::collections::VecDeque;

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Init,
    Message,
    ToolUse,
    ToolResult,
    Result,
    Error,
    Unknown,
}

impl EventKind {
    fn from_type(kind: &str) -> Self {
        match kind {
            "init" => Self::Init,
            "message" => Self::Message,
            "tool_use" => Self::ToolUse,
            "tool_result" => Self::ToolResult,
            "result" => Self::Result,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Message => "message",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::Result => "result",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// One parsed line of worker output.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub role: Option<String>,
    pub content: String,
    pub tool_name: Option<String>,
    pub tool_id: Option<String>,
    pub tool_args: Option<Value>,
    pub status: Option<String>,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub raw: String,
}

impl Event {
    fn unknown(raw: &str) -> Self {
        Self {
            kind: EventKind::Unknown,
            role: None,
            content: String::new(),
            tool_name: None,
            tool_id: None,
            tool_args: None,
            status: None,
            session_id: None,
            model: None,
            raw: raw.to_string(),
        }
    }

    /// Short single-line summary for logs.
    pub fn summary(&self) -> String {
        let text = match self.kind {
            EventKind::ToolUse => self.tool_name.clone().unwrap_or_default(),
            EventKind::Result | EventKind::ToolResult if self.content.is_empty() => {
                self.status.clone().unwrap_or_default()
            }
            EventKind::Unknown if self.content.is_empty() => self.raw.clone(),
            _ => self.content.clone(),
        };
        let first = text.lines().next().unwrap_or("");
        format!("{}: {}", self.kind.as_str(), truncate_safe(first, 120))
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: Option<Value>,
    role: Option<Value>,
    content: Option<Value>,
    output: Option<Value>,
    tool_name: Option<Value>,
    tool_id: Option<Value>,
    parameters: Option<Value>,
    args: Option<Value>,
    status: Option<Value>,
    session_id: Option<Value>,
    model: Option<Value>,
}

/// Turn one output line into an event. Total: never panics.
pub fn parse_line(line: &str) -> Event {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Event::unknown(line);
    }

    if !trimmed.starts_with('{') {
        return Event {
            kind: EventKind::Message,
            role: Some("system".to_string()),
            content: trimmed.to_string(),
            ..Event::unknown(line)
        };
    }

    let Ok(wire) = serde_json::from_str::<WireEvent>(trimmed) else {
        return Event::unknown(line);
    };

    let kind = field_text(wire.kind).map_or(EventKind::Unknown, |k| EventKind::from_type(&k));

    let content = match (wire.content, kind) {
        (Some(v), _) => value_text(v),
        (None, EventKind::ToolResult) => wire.output.map(value_text).unwrap_or_default(),
        (None, _) => String::new(),
    };

    Event {
        kind,
        role: field_text(wire.role),
        content,
        tool_name: field_text(wire.tool_name),
        tool_id: field_text(wire.tool_id),
        tool_args: wire.parameters.or(wire.args),
        status: field_text(wire.status),
        session_id: field_text(wire.session_id),
        model: field_text(wire.model),
        raw: line.to_string(),
    }
}

/// Scalar fields are stringified whatever their JSON type; null is absent.
fn field_text(value: Option<Value>) -> Option<String> {
    value.filter(|v| !v.is_null()).map(value_text)
}

fn value_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Truncate a string at a valid UTF-8 char boundary.
fn truncate_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// The identity ran out of quota or was throttled.
    RateLimit,
    /// The agent refused to continue on unsafe input.
    ParseSafety,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalMatch {
    pub kind: FatalKind,
    pub pattern: String,
    pub reason: String,
}

const BUILTIN_PATTERNS: &[(&str, FatalKind, &str)] = &[
    ("resource_exhausted", FatalKind::RateLimit, "quota exhausted"),
    ("exhausted your capacity", FatalKind::RateLimit, "quota exhausted"),
    ("quota exceeded", FatalKind::RateLimit, "quota exceeded"),
    ("rate limit exceeded", FatalKind::RateLimit, "rate limited"),
    ("429 too many requests", FatalKind::RateLimit, "rate limited"),
    ("unsafe to parse", FatalKind::ParseSafety, "parse-safety rejection"),
    ("refusing to parse", FatalKind::ParseSafety, "parse-safety rejection"),
    ("fatal error:", FatalKind::Fatal, "fatal error reported"),
    ("[fatal]", FatalKind::Fatal, "fatal error reported"),
];

/// Substring matcher for worker output that means the run cannot recover.
#[derive(Debug, Clone)]
pub struct FatalDetector {
    patterns: Vec<(String, FatalKind, String)>,
}

impl Default for FatalDetector {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl FatalDetector {
    /// Built-in patterns plus `extra` (treated as generic fatal markers).
    pub fn new(extra: &[String]) -> Self {
        let mut patterns: Vec<_> = BUILTIN_PATTERNS
            .iter()
            .map(|(p, kind, reason)| ((*p).to_string(), *kind, (*reason).to_string()))
            .collect();
        patterns.extend(
            extra
                .iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| (p.to_lowercase(), FatalKind::Fatal, format!("matched {p:?}"))),
        );
        Self { patterns }
    }

    /// Checks content and raw line, case-insensitively.
    pub fn detect(&self, event: &Event) -> Option<FatalMatch> {
        let content = event.content.to_lowercase();
        let raw = event.raw.to_lowercase();
        self.patterns
            .iter()
            .find(|(p, _, _)| content.contains(p.as_str()) || raw.contains(p.as_str()))
            .map(|(pattern, kind, reason)| FatalMatch {
                kind: *kind,
                pattern: pattern.clone(),
                reason: reason.clone(),
            })
    }
}

/// Default retained events per worker.
pub const HISTORY_CAP: usize = 500;

/// Bounded event history with an optional cursor (e.g. a selected row).
///
/// When the oldest entry is evicted the cursor shifts down by one so it
/// keeps pointing at the same event; a cursor on the evicted entry clears.
#[derive(Debug, Clone)]
pub struct EventHistory {
    entries: VecDeque<Event>,
    cap: usize,
    cursor: Option<usize>,
}

impl Default for EventHistory {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAP)
    }
}

impl EventHistory {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap.min(HISTORY_CAP)),
            cap: cap.max(1),
            cursor: None,
        }
    }

    pub fn push(&mut self, event: Event) {
        self.entries.push_back(event);
        while self.entries.len() > self.cap {
            self.entries.pop_front();
            self.cursor = match self.cursor {
                Some(0) | None => None,
                Some(i) => Some(i - 1),
            };
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Event> {
        self.entries.get(index)
    }

    pub fn last(&self) -> Option<&Event> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.entries.iter()
    }

    pub const fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// Point the cursor at `index`; out-of-range indexes clear it.
    pub fn set_cursor(&mut self, index: Option<usize>) {
        self.cursor = index.filter(|i| *i < self.entries.len());
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_init() {
        let e = parse_line(r#"{"type":"init","session_id":"s-1","model":"gemini-2.5-pro"}"#);
        assert_eq!(e.kind, EventKind::Init);
        assert_eq!(e.session_id.as_deref(), Some("s-1"));
        assert_eq!(e.model.as_deref(), Some("gemini-2.5-pro"));
    }

    #[test]
    fn parses_message() {
        let e = parse_line(r#"{"type":"message","role":"assistant","content":"Looking at the code"}"#);
        assert_eq!(e.kind, EventKind::Message);
        assert_eq!(e.role.as_deref(), Some("assistant"));
        assert_eq!(e.content, "Looking at the code");
    }

    #[test]
    fn parses_tool_use_with_parameters() {
        let e = parse_line(
            r#"{"type":"tool_use","tool_name":"read_file","tool_id":"t1","parameters":{"path":"a.rs"}}"#,
        );
        assert_eq!(e.kind, EventKind::ToolUse);
        assert_eq!(e.tool_name.as_deref(), Some("read_file"));
        assert_eq!(e.tool_id.as_deref(), Some("t1"));
        assert_eq!(e.tool_args, Some(json!({"path": "a.rs"})));
    }

    #[test]
    fn tool_args_fall_back_to_args_and_parameters_win() {
        let e = parse_line(r#"{"type":"tool_use","tool_name":"sh","args":{"cmd":"ls"}}"#);
        assert_eq!(e.tool_args, Some(json!({"cmd": "ls"})));

        let e = parse_line(r#"{"type":"tool_use","parameters":{"a":1},"args":{"b":2}}"#);
        assert_eq!(e.tool_args, Some(json!({"a": 1})));
    }

    #[test]
    fn tool_result_uses_output_when_content_missing() {
        let e = parse_line(r#"{"type":"tool_result","tool_id":"t1","status":"success","output":"ok"}"#);
        assert_eq!(e.kind, EventKind::ToolResult);
        assert_eq!(e.status.as_deref(), Some("success"));
        assert_eq!(e.content, "ok");

        let e = parse_line(r#"{"type":"tool_result","content":"from content","output":"ignored"}"#);
        assert_eq!(e.content, "from content");
    }

    #[test]
    fn output_ignored_for_other_types() {
        let e = parse_line(r#"{"type":"message","output":"not content"}"#);
        assert_eq!(e.content, "");
    }

    #[test]
    fn parses_result_and_error() {
        let e = parse_line(r#"{"type":"result","status":"success"}"#);
        assert_eq!(e.kind, EventKind::Result);
        assert_eq!(e.status.as_deref(), Some("success"));

        let e = parse_line(r#"{"type":"error","content":"boom"}"#);
        assert_eq!(e.kind, EventKind::Error);
        assert_eq!(e.content, "boom");
    }

    #[test]
    fn non_string_content_is_serialized() {
        let e = parse_line(r#"{"type":"message","content":[{"text":"hi"}]}"#);
        assert_eq!(e.content, r#"[{"text":"hi"}]"#);
    }

    #[test]
    fn unknown_type_maps_to_unknown() {
        let e = parse_line(r#"{"type":"telemetry","content":"x"}"#);
        assert_eq!(e.kind, EventKind::Unknown);
        assert_eq!(e.content, "x");

        let e = parse_line(r#"{"content":"no type"}"#);
        assert_eq!(e.kind, EventKind::Unknown);
    }

    #[test]
    fn empty_line_is_unknown() {
        let e = parse_line("");
        assert_eq!(e.kind, EventKind::Unknown);
        assert_eq!(e.raw, "");

        let e = parse_line("   ");
        assert_eq!(e.kind, EventKind::Unknown);
        assert_eq!(e.raw, "   ");
    }

    #[test]
    fn plain_text_is_system_message() {
        let e = parse_line("Loaded cached credentials.");
        assert_eq!(e.kind, EventKind::Message);
        assert_eq!(e.role.as_deref(), Some("system"));
        assert_eq!(e.content, "Loaded cached credentials.");
        assert_eq!(e.raw, "Loaded cached credentials.");
    }

    #[test]
    fn malformed_json_is_unknown_with_raw() {
        let line = r#"{"type":"message","content":"#;
        let e = parse_line(line);
        assert_eq!(e.kind, EventKind::Unknown);
        assert_eq!(e.raw, line);
    }

    #[test]
    fn wrong_field_types_fall_back_to_unknown() {
        let e = parse_line(r#"{"type":42}"#);
        assert_eq!(e.kind, EventKind::Unknown);
        assert_eq!(e.raw, r#"{"type":42}"#);
    }

    #[test]
    fn non_string_scalars_keep_the_event() {
        let e = parse_line(r#"{"type":"error","content":"boom","tool_id":7,"status":null,"model":true}"#);
        assert_eq!(e.kind, EventKind::Error);
        assert_eq!(e.content, "boom");
        assert_eq!(e.tool_id.as_deref(), Some("7"));
        assert_eq!(e.status, None);
        assert_eq!(e.model.as_deref(), Some("true"));
    }

    #[test]
    fn detects_fatal_in_content() {
        let detector = FatalDetector::default();
        let e = parse_line(r#"{"type":"error","content":"RESOURCE_EXHAUSTED: try later"}"#);
        let m = detector.detect(&e).unwrap();
        assert_eq!(m.kind, FatalKind::RateLimit);
    }

    #[test]
    fn detects_fatal_in_raw_line() {
        let detector = FatalDetector::default();
        let e = parse_line(r#"{"type":"error","message":"Rate limit exceeded for model"}"#);
        assert!(e.content.is_empty());
        assert_eq!(detector.detect(&e).unwrap().kind, FatalKind::RateLimit);

        let e = parse_line("[FATAL] worker crashed");
        assert_eq!(detector.detect(&e).unwrap().kind, FatalKind::Fatal);
    }

    #[test]
    fn detects_parse_safety_and_extra_patterns() {
        let detector = FatalDetector::new(&["Segmentation fault".to_string()]);
        let e = parse_line("Refusing to parse untrusted tool output");
        assert_eq!(detector.detect(&e).unwrap().kind, FatalKind::ParseSafety);

        let e = parse_line("segmentation fault (core dumped)");
        assert_eq!(detector.detect(&e).unwrap().kind, FatalKind::Fatal);
    }

    #[test]
    fn ordinary_output_is_not_fatal() {
        let detector = FatalDetector::default();
        let e = parse_line(r#"{"type":"message","content":"All tests passed"}"#);
        assert!(detector.detect(&e).is_none());
    }

    #[test]
    fn history_evicts_oldest_and_shifts_cursor() {
        let mut history = EventHistory::with_capacity(3);
        for i in 0..3 {
            history.push(parse_line(&format!("line {i}")));
        }
        history.set_cursor(Some(2));

        history.push(parse_line("line 3"));
        assert_eq!(history.len(), 3);
        assert_eq!(history.get(0).unwrap().content, "line 1");
        assert_eq!(history.cursor(), Some(1));
        assert_eq!(history.get(1).unwrap().content, "line 2");
    }

    #[test]
    fn history_cursor_on_evicted_entry_clears() {
        let mut history = EventHistory::with_capacity(2);
        history.push(parse_line("a"));
        history.push(parse_line("b"));
        history.set_cursor(Some(0));
        history.push(parse_line("c"));
        assert_eq!(history.cursor(), None);
        assert_eq!(history.last().unwrap().content, "c");
    }

    #[test]
    fn set_cursor_out_of_range_clears() {
        let mut history = EventHistory::with_capacity(2);
        history.push(parse_line("a"));
        history.set_cursor(Some(5));
        assert_eq!(history.cursor(), None);
    }

    #[test]
    fn summary_truncates_long_lines() {
        let long = "x".repeat(400);
        let e = parse_line(&long);
        assert!(e.summary().len() < 140);
        assert!(e.summary().starts_with("message: "));
    }
}
