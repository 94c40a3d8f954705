pub mod anthropic;
pub mod openai;

use kirogate_schema::ToolCall;

use crate::tokenizer;
use crate::upstream::{DecodedEvent, deduplicate_tool_calls, parse_bracket_tool_calls};

/// Accumulated response state shared by both dialects.
#[derive(Debug, Default)]
pub(crate) struct ResponseAccumulator {
    pub text: String,
    pub credits_used: Option<f64>,
    pub context_usage_percent: Option<f64>,
}

impl ResponseAccumulator {
    pub fn observe(&mut self, event: &DecodedEvent) {
        match event {
            DecodedEvent::Content(content) => self.text.push_str(content),
            DecodedEvent::Usage(credits) => self.credits_used = Some(*credits),
            DecodedEvent::ContextUsage(percent) => self.context_usage_percent = Some(*percent),
        }
    }

    /// The upstream has no explicit length-cap event; a full context window
    /// is the observable signal.
    pub fn hit_length_cap(&self) -> bool {
        self.context_usage_percent.is_some_and(|p| p >= 100.0)
    }

    /// Merge structured tool calls with the bracket-text fallback and dedup.
    pub fn collect_tool_calls(&self, structured: Vec<ToolCall>) -> Vec<ToolCall> {
        let mut combined = structured;
        combined.extend(parse_bracket_tool_calls(&self.text));
        deduplicate_tool_calls(combined)
    }

    pub fn output_tokens(&self, tool_calls: &[ToolCall]) -> u32 {
        let mut total = tokenizer::count_tokens(&self.text);
        for tc in tool_calls {
            total += tokenizer::count_tokens(&tc.function.name);
            total += tokenizer::count_tokens(&tc.function.arguments);
        }
        total
    }
}

/// Finish reason in OpenAI spelling; `map_stop_reason` converts for Anthropic.
pub(crate) fn finish_reason(has_tool_calls: bool, hit_length_cap: bool) -> &'static str {
    if has_tool_calls {
        "tool_calls"
    } else if hit_length_cap {
        "length"
    } else {
        "stop"
    }
}

pub(crate) fn map_stop_reason(finish: &str) -> &'static str {
    match finish {
        "tool_calls" => "tool_use",
        "length" => "max_tokens",
        _ => "end_turn",
    }
}

/// Split a leading `<thinking>...</thinking>` section out of response text.
/// Only applied when the caller opted into extended thinking.
pub(crate) fn split_thinking(text: &str) -> (Option<String>, String) {
    let trimmed = text.trim_start();
    let Some(rest) = trimmed.strip_prefix("<thinking>") else {
        return (None, text.to_string());
    };
    let Some(end) = rest.find("</thinking>") else {
        return (None, text.to_string());
    };
    let thinking = rest[..end].trim().to_string();
    let remainder = rest[end + "</thinking>".len()..]
        .trim_start()
        .to_string();
    (Some(thinking), remainder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kirogate_schema::FunctionCall;

    fn call(name: &str) -> ToolCall {
        ToolCall {
            id: "t1".to_string(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: "{}".to_string(),
            },
        }
    }

    #[test]
    fn finish_reason_prefers_tool_calls_over_length() {
        assert_eq!(finish_reason(true, true), "tool_calls");
        assert_eq!(finish_reason(false, true), "length");
        assert_eq!(finish_reason(false, false), "stop");
    }

    #[test]
    fn stop_reason_mapping_covers_all_finishes() {
        assert_eq!(map_stop_reason("tool_calls"), "tool_use");
        assert_eq!(map_stop_reason("length"), "max_tokens");
        assert_eq!(map_stop_reason("stop"), "end_turn");
    }

    #[test]
    fn accumulator_tracks_events() {
        let mut acc = ResponseAccumulator::default();
        acc.observe(&DecodedEvent::Content("hi".to_string()));
        acc.observe(&DecodedEvent::Usage(3.0));
        acc.observe(&DecodedEvent::ContextUsage(100.0));
        assert_eq!(acc.text, "hi");
        assert_eq!(acc.credits_used, Some(3.0));
        assert!(acc.hit_length_cap());
    }

    #[test]
    fn bracket_calls_merge_with_structured_ones() {
        let mut acc = ResponseAccumulator::default();
        acc.text = r#"[Called get_time with args: {"tz": "UTC"}]"#.to_string();
        let collected = acc.collect_tool_calls(vec![call("get_weather")]);
        assert_eq!(collected.len(), 2);
    }

    #[test]
    fn thinking_split_requires_closing_tag() {
        let (thinking, rest) = split_thinking("<thinking>\nplan\n</thinking>\nanswer");
        assert_eq!(thinking.as_deref(), Some("plan"));
        assert_eq!(rest, "answer");

        let (thinking, rest) = split_thinking("<thinking>unterminated");
        assert!(thinking.is_none());
        assert_eq!(rest, "<thinking>unterminated");

        let (thinking, rest) = split_thinking("plain answer");
        assert!(thinking.is_none());
        assert_eq!(rest, "plain answer");
    }
}
