//! OpenAI Chat Completions request schema.
//!
//! Schema reference:
//! https://platform.openai.com/docs/api-reference/chat/create
//!
//! `extra` collects unknown/new fields so deserialization doesn't break when
//! clients send fields this gateway ignores (`presence_penalty`, `user`, ...).

use crate::content::MessageContent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,

    #[serde(default)]
    pub messages: Vec<ChatMessage>,

    #[serde(default)]
    pub stream: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Newer alias for `max_tokens`; preferred when both are present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,

    /// `string | array` in the public schema; normalized to a list.
    #[serde(
        default,
        deserialize_with = "deserialize_stop",
        skip_serializing_if = "Option::is_none"
    )]
    pub stop: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ChatCompletionRequest {
    /// Effective completion cap: `max_completion_tokens` wins over `max_tokens`.
    pub fn completion_cap(&self) -> Option<u32> {
        self.max_completion_tokens.or(self.max_tokens)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// Set on `role: "tool"` messages to reference the originating call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: MessageContent) -> Self {
        Self {
            role: role.into(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Completed tool call as carried on assistant messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type", default = "default_function_type")]
    pub kind: String,

    pub function: super::FunctionCall,
}

fn default_function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default = "default_function_type")]
    pub kind: String,

    pub function: ToolFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

fn deserialize_stop<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawStop {
        One(String),
        Many(Vec<String>),
    }

    let raw: Option<RawStop> = Option::deserialize(deserializer)?;
    Ok(raw.map(|r| match r {
        RawStop::One(s) => vec![s],
        RawStop::Many(v) => v,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stop_accepts_string_and_array() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "stop": "END"
        }))
        .unwrap();
        assert_eq!(req.stop, Some(vec!["END".to_string()]));

        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "messages": [],
            "stop": ["a", "b"]
        }))
        .unwrap();
        assert_eq!(req.stop, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn unknown_fields_are_collected_not_rejected() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "presence_penalty": 0.5,
            "user": "abc"
        }))
        .unwrap();
        assert!(req.extra.contains_key("presence_penalty"));
        assert!(req.extra.contains_key("user"));
    }

    #[test]
    fn max_completion_tokens_wins_over_max_tokens() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [],
            "max_tokens": 10,
            "max_completion_tokens": 20
        }))
        .unwrap();
        assert_eq!(req.completion_cap(), Some(20));
    }
}
