//! Approximate token counting.
//!
//! The exact Claude tokenizer is not public; counts come from tiktoken's
//! cl100k_base encoding with an empirical correction factor. Comparison
//! against upstream context-usage reports puts Claude-family tokenization
//! about 15% above cl100k_base.

use std::sync::LazyLock;
use tiktoken_rs::CoreBPE;

use kirogate_schema::{ChatMessage, MessageContent, Tool};

/// Claude tokenizes roughly 15% more tokens than cl100k_base.
const CLAUDE_CORRECTION_FACTOR: f64 = 1.15;

/// Service tokens per message (role markers, separators).
const TOKENS_PER_MESSAGE: u32 = 4;
/// Trailing service tokens per request.
const TOKENS_PER_REQUEST: u32 = 3;
/// Flat estimate for an image block.
const TOKENS_PER_IMAGE: u32 = 100;

static ENCODING: LazyLock<CoreBPE> = LazyLock::new(|| {
    tiktoken_rs::cl100k_base().expect("failed to initialize cl100k_base encoding")
});

fn encode_len(text: &str) -> u32 {
    u32::try_from(ENCODING.encode_with_special_tokens(text).len()).unwrap_or(u32::MAX)
}

fn correct(tokens: u32) -> u32 {
    (f64::from(tokens) * CLAUDE_CORRECTION_FACTOR) as u32
}

/// Token count for a plain text span, with the Claude correction applied.
pub fn count_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    correct(encode_len(text))
}

/// Token count for a message list. Field counts are raw; the correction is
/// applied once to the total.
pub fn count_message_tokens(messages: &[ChatMessage]) -> u32 {
    if messages.is_empty() {
        return 0;
    }

    let mut total: u32 = 0;
    for message in messages {
        total += TOKENS_PER_MESSAGE;
        total += encode_len(&message.role);

        match &message.content {
            Some(MessageContent::Text(text)) => total += encode_len(text),
            Some(MessageContent::Blocks(blocks)) => {
                for block in blocks {
                    match block {
                        kirogate_schema::ContentBlock::Text { text } => total += encode_len(text),
                        kirogate_schema::ContentBlock::Image { .. }
                        | kirogate_schema::ContentBlock::ImageUrl { .. } => {
                            total += TOKENS_PER_IMAGE;
                        }
                        kirogate_schema::ContentBlock::ToolUse { name, input, .. } => {
                            total += encode_len(name);
                            total += encode_len(&input.to_string());
                        }
                        kirogate_schema::ContentBlock::ToolResult { content, .. } => {
                            total += encode_len(&content.to_string());
                        }
                        kirogate_schema::ContentBlock::Thinking { thinking, .. } => {
                            total += encode_len(thinking);
                        }
                        kirogate_schema::ContentBlock::Unknown => {}
                    }
                }
            }
            None => {}
        }

        if let Some(tool_calls) = &message.tool_calls {
            for tc in tool_calls {
                total += TOKENS_PER_MESSAGE;
                total += encode_len(&tc.function.name);
                total += encode_len(&tc.function.arguments);
            }
        }
        if let Some(tool_call_id) = &message.tool_call_id {
            total += encode_len(tool_call_id);
        }
    }
    total += TOKENS_PER_REQUEST;

    correct(total)
}

/// Token count for tool definitions (name, description, JSON schema).
pub fn count_tools_tokens(tools: Option<&[Tool]>) -> u32 {
    let Some(tools) = tools else {
        return 0;
    };
    if tools.is_empty() {
        return 0;
    }

    let mut total: u32 = 0;
    for tool in tools {
        total += TOKENS_PER_MESSAGE;
        total += encode_len(&tool.function.name);
        if let Some(description) = &tool.function.description {
            total += encode_len(description);
        }
        if let Some(parameters) = &tool.function.parameters {
            total += encode_len(&parameters.to_string());
        }
    }
    correct(total)
}

/// Input-token estimate for one request: messages + tools + system prompt.
pub fn estimate_request_tokens(
    messages: &[ChatMessage],
    tools: Option<&[Tool]>,
    system_prompt: Option<&str>,
) -> u32 {
    count_message_tokens(messages)
        + count_tools_tokens(tools)
        + system_prompt.map_or(0, count_tokens)
}
