//! Decoder for the CodeWhisperer event stream.
//!
//! The upstream response body is a concatenation of AWS event-stream frames
//! whose payloads, decoded as UTF-8, contain brace-delimited JSON objects
//! with a small set of discriminating key prefixes. The decoder accumulates
//! bytes, carves out complete JSON frames with a string-aware brace scanner,
//! and emits typed events; tool-call frames mutate internal assembly state
//! instead of being emitted directly.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::utils::ids::generate_tool_call_id;
use kirogate_schema::{FunctionCall, ToolCall};

/// One decoded upstream event.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    Content(String),
    Usage(f64),
    ContextUsage(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FrameKind {
    Content,
    ToolStart,
    ToolInput,
    ToolStop,
    Followup,
    Usage,
    ContextUsage,
}

const EVENT_PATTERNS: [(&str, FrameKind); 7] = [
    ("{\"content\":", FrameKind::Content),
    ("{\"name\":", FrameKind::ToolStart),
    ("{\"input\":", FrameKind::ToolInput),
    ("{\"stop\":", FrameKind::ToolStop),
    ("{\"followupPrompt\":", FrameKind::Followup),
    ("{\"usage\":", FrameKind::Usage),
    ("{\"contextUsagePercentage\":", FrameKind::ContextUsage),
];

/// Position of the matching `}` for the `{` at `start`, honoring quoted
/// strings and backslash escapes inside them. `None` when the frame is not
/// yet complete in `text`.
///
/// Only `\\` matters for boundary detection: it is the one escape that could
/// otherwise hide a closing `"`. Unicode escapes (`\u0022`) contain no
/// literal quote and cannot confuse the scan.
pub fn find_matching_brace(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if start >= bytes.len() || bytes[start] != b'{' {
        return None;
    }

    let mut brace_count = 0i64;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escape_next {
            escape_next = false;
            continue;
        }
        match b {
            b'\\' if in_string => escape_next = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => brace_count += 1,
            b'}' if !in_string => {
                brace_count -= 1;
                if brace_count == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: String,
    /// Last emitted content payload, for collapsing upstream repeats.
    last_content: Option<String>,
    pending: Option<PendingToolCall>,
    tool_calls: Vec<ToolCall>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete frame currently buffered.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DecodedEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        loop {
            let Some((pos, kind)) = self.earliest_pattern() else {
                break;
            };
            let Some(end) = find_matching_brace(&self.buffer, pos) else {
                // Frame incomplete; keep bytes for the next feed.
                break;
            };

            let frame = self.buffer[pos..=end].to_string();
            self.buffer.drain(..=end);

            match serde_json::from_str::<Value>(&frame) {
                Ok(data) => {
                    if let Some(event) = self.process_frame(&data, kind) {
                        events.push(event);
                    }
                }
                Err(_) => {
                    warn!("Failed to parse event frame: {:.100}", frame);
                }
            }
        }
        events
    }

    fn earliest_pattern(&self) -> Option<(usize, FrameKind)> {
        EVENT_PATTERNS
            .iter()
            .filter_map(|(pattern, kind)| self.buffer.find(pattern).map(|pos| (pos, *kind)))
            .min_by_key(|(pos, _)| *pos)
    }

    fn process_frame(&mut self, data: &Value, kind: FrameKind) -> Option<DecodedEvent> {
        match kind {
            FrameKind::Content => self.process_content(data),
            FrameKind::ToolStart => {
                self.process_tool_start(data);
                None
            }
            FrameKind::ToolInput => {
                self.process_tool_input(data);
                None
            }
            FrameKind::ToolStop => {
                if data.get("stop").and_then(Value::as_bool).unwrap_or(false) {
                    self.finalize_tool_call();
                }
                None
            }
            FrameKind::Followup => None,
            FrameKind::Usage => Some(DecodedEvent::Usage(
                data.get("usage").and_then(Value::as_f64).unwrap_or(0.0),
            )),
            FrameKind::ContextUsage => Some(DecodedEvent::ContextUsage(
                data.get("contextUsagePercentage")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
            )),
        }
    }

    fn process_content(&mut self, data: &Value) -> Option<DecodedEvent> {
        if data.get("followupPrompt").is_some() {
            return None;
        }

        let content = data
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        // The upstream sometimes repeats the final content frame.
        if self.last_content.as_deref() == Some(content.as_str()) {
            return None;
        }
        self.last_content = Some(content.clone());
        Some(DecodedEvent::Content(content))
    }

    fn process_tool_start(&mut self, data: &Value) {
        if self.pending.is_some() {
            self.finalize_tool_call();
        }

        self.pending = Some(PendingToolCall {
            id: data
                .get("toolUseId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(generate_tool_call_id),
            name: data
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            arguments: input_fragment(data),
        });

        if data.get("stop").and_then(Value::as_bool).unwrap_or(false) {
            self.finalize_tool_call();
        }
    }

    fn process_tool_input(&mut self, data: &Value) {
        if let Some(pending) = self.pending.as_mut() {
            pending.arguments.push_str(&input_fragment(data));
        }
    }

    fn finalize_tool_call(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        let arguments = normalize_arguments(&pending.name, &pending.arguments);
        self.tool_calls.push(ToolCall {
            id: pending.id,
            kind: "function".to_string(),
            function: FunctionCall {
                name: pending.name,
                arguments,
            },
        });
    }

    /// Finalize any pending call and return the deduplicated set.
    pub fn take_tool_calls(&mut self) -> Vec<ToolCall> {
        self.finalize_tool_call();
        deduplicate_tool_calls(std::mem::take(&mut self.tool_calls))
    }

    pub fn has_tool_calls(&self) -> bool {
        self.pending.is_some() || !self.tool_calls.is_empty()
    }
}

/// `input` may arrive as a string fragment or as an already-parsed object.
fn input_fragment(data: &Value) -> String {
    match data.get("input") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn normalize_arguments(tool_name: &str, raw: &str) -> String {
    if raw.trim().is_empty() {
        // Normal for duplicate tool frames; dedup drops the empty copy.
        debug!("Tool '{tool_name}' has empty arguments string");
        return "{}".to_string();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(parsed) => parsed.to_string(),
        Err(e) => {
            warn!("Failed to parse tool '{tool_name}' arguments: {e}. Raw: {:.200}", raw);
            "{}".to_string()
        }
    }
}

static BRACKET_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[Called\s+(\w+)\s+with\s+args:\s*").expect("invalid bracket tool-call regex")
});

/// Extract tool calls inlined in prose as `[Called <name> with args: {...}]`.
/// Some replies use this textual form instead of structured frames.
pub fn parse_bracket_tool_calls(response_text: &str) -> Vec<ToolCall> {
    if !response_text.contains("[Called") {
        return Vec::new();
    }

    let mut tool_calls = Vec::new();
    for captures in BRACKET_CALL_RE.captures_iter(response_text) {
        let name = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        let args_start = captures.get(0).map(|m| m.end()).unwrap_or_default();

        let Some(rel) = response_text[args_start..].find('{') else {
            continue;
        };
        let json_start = args_start + rel;
        let Some(json_end) = find_matching_brace(response_text, json_start) else {
            continue;
        };
        let json_str = &response_text[json_start..=json_end];

        match serde_json::from_str::<Value>(json_str) {
            Ok(args) => tool_calls.push(ToolCall {
                id: generate_tool_call_id(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: name.to_string(),
                    arguments: args.to_string(),
                },
            }),
            Err(_) => {
                warn!("Failed to parse tool call arguments: {:.100}", json_str);
            }
        }
    }
    tool_calls
}

/// Drop duplicate tool calls.
///
/// Two passes: by `id`, keeping the copy with non-empty (or longer)
/// arguments; then by `(name, arguments)` across the whole set.
pub fn deduplicate_tool_calls(tool_calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let original_len = tool_calls.len();

    let mut with_id: Vec<ToolCall> = Vec::new();
    let mut without_id: Vec<ToolCall> = Vec::new();

    for tc in tool_calls {
        if tc.id.is_empty() {
            without_id.push(tc);
            continue;
        }
        match with_id.iter_mut().find(|existing| existing.id == tc.id) {
            None => with_id.push(tc),
            Some(existing) => {
                let existing_args = existing.function.arguments.as_str();
                let current_args = tc.function.arguments.as_str();
                if current_args != "{}"
                    && (existing_args == "{}" || current_args.len() > existing_args.len())
                {
                    debug!(
                        "Replacing tool call {} with better arguments: {} -> {}",
                        tc.id,
                        existing_args.len(),
                        current_args.len()
                    );
                    *existing = tc;
                }
            }
        }
    }

    let mut seen = ahash::AHashSet::new();
    let mut unique = Vec::new();
    for tc in with_id.into_iter().chain(without_id) {
        let key = format!("{}-{}", tc.function.name, tc.function.arguments);
        if seen.insert(key) {
            unique.push(tc);
        }
    }

    if unique.len() != original_len {
        debug!("Deduplicated tool calls: {original_len} -> {}", unique.len());
    }
    unique
}
