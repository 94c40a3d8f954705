//! Text extraction over the mixed string / block-list content shapes.

use kirogate_schema::{ContentBlock, MessageContent};
use serde_json::Value;

/// Flatten message content to plain text. Non-text blocks contribute their
/// textual projection (thinking prose, image placeholders); structural
/// blocks (tool_use, tool_result) contribute nothing here — they are
/// extracted separately by the payload builder.
pub fn extract_text(content: Option<&MessageContent>) -> String {
    match content {
        None => String::new(),
        Some(MessageContent::Text(text)) => text.clone(),
        Some(MessageContent::Blocks(blocks)) => {
            let mut parts = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => parts.push(text.clone()),
                    ContentBlock::Thinking { thinking, .. } => parts.push(thinking.clone()),
                    _ => {}
                }
            }
            parts.join("")
        }
    }
}

/// Text projection of a raw JSON content value, as found inside
/// `tool_result.content`: a string, a list of text-bearing objects, or
/// anything else (serialized as-is).
pub fn extract_text_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                Value::Object(obj) => obj
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(""),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_content_passes_through() {
        assert_eq!(
            extract_text(Some(&MessageContent::text("Hello"))),
            "Hello"
        );
        assert_eq!(extract_text(None), "");
    }

    #[test]
    fn block_text_concatenates_without_separator() {
        let content = MessageContent::Blocks(vec![
            ContentBlock::text("Hello"),
            ContentBlock::text(" world"),
        ]);
        assert_eq!(extract_text(Some(&content)), "Hello world");
    }

    #[test]
    fn tool_result_value_forms_flatten() {
        assert_eq!(extract_text_value(&json!("plain")), "plain");
        assert_eq!(
            extract_text_value(&json!([{"type": "text", "text": "a"}, {"text": "b"}])),
            "ab"
        );
        assert_eq!(extract_text_value(&Value::Null), "");
    }
}
