//! Anthropic Messages -> internal OpenAI-style conversion.
//!
//! The gateway normalizes both public dialects to the OpenAI shape before
//! building the upstream payload, so the Anthropic path is a front-end over
//! the same builder. Blocks are demoted where the internal shape has no
//! equivalent: images become placeholder text, thinking becomes
//! `<thinking>` prose, `tool_use` becomes `tool_calls`, `tool_result`
//! stays a block on a user message.

use serde_json::{Value, json};

use kirogate_schema::{
    AnthropicMessage, ChatCompletionRequest, ChatMessage, ContentBlock, FunctionCall,
    MessageContent, MessagesRequest, SystemPrompt, Tool, ToolCall, ToolFunction,
};

pub fn to_chat_completion_request(request: &MessagesRequest) -> ChatCompletionRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = &request.system {
        let text = match system {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        };
        if !text.is_empty() {
            messages.push(ChatMessage::new("system", MessageContent::Text(text)));
        }
    }

    for message in &request.messages {
        messages.push(convert_message(message));
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| Tool {
                kind: "function".to_string(),
                function: ToolFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                },
            })
            .collect::<Vec<_>>()
    });

    let tool_choice = request.tool_choice.as_ref().map(|choice| match choice.kind.as_str() {
        "any" => json!("required"),
        "tool" => json!({
            "type": "function",
            "function": {"name": choice.name.clone().unwrap_or_default()},
        }),
        "none" => json!("none"),
        _ => json!("auto"),
    });

    ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        stream: request.stream,
        temperature: request.temperature,
        top_p: request.top_p,
        max_tokens: Some(request.max_tokens),
        max_completion_tokens: None,
        stop: request.stop_sequences.clone(),
        tools,
        tool_choice,
        extra: std::collections::BTreeMap::new(),
    }
}

fn convert_message(message: &AnthropicMessage) -> ChatMessage {
    let blocks = match &message.content {
        MessageContent::Text(text) => {
            return ChatMessage::new(message.role.clone(), MessageContent::Text(text.clone()));
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut result_blocks: Vec<ContentBlock> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => text_parts.push(text.clone()),
            ContentBlock::Image { source } => {
                text_parts.push(image_placeholder(source.media_type.as_deref(), source.url.as_deref()));
            }
            ContentBlock::ImageUrl { image_url } => {
                text_parts.push(image_placeholder(None, Some(&image_url.url)));
            }
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: serialize_input(input),
                },
            }),
            ContentBlock::ToolResult { .. } => result_blocks.push(block.clone()),
            ContentBlock::Thinking { thinking, .. } => {
                text_parts.push(format!("<thinking>\n{thinking}\n</thinking>"));
            }
            ContentBlock::Unknown => {}
        }
    }

    let mut converted = ChatMessage::new(message.role.clone(), MessageContent::Text(String::new()));

    if result_blocks.is_empty() {
        converted.content = Some(MessageContent::Text(text_parts.join("\n")));
    } else {
        // Tool results stay blocks so the payload builder can lift them
        // into `userInputMessageContext.toolResults`.
        let mut combined = result_blocks;
        if !text_parts.is_empty() {
            combined.push(ContentBlock::text(text_parts.join("\n")));
        }
        converted.content = Some(MessageContent::Blocks(combined));
    }

    if !tool_calls.is_empty() {
        converted.tool_calls = Some(tool_calls);
    }
    converted
}

fn image_placeholder(media_type: Option<&str>, url: Option<&str>) -> String {
    match (media_type, url) {
        (Some(media_type), _) => format!("[Image: {media_type}]"),
        (None, Some(url)) => format!("[Image URL: {url}]"),
        (None, None) => "[Image]".to_string(),
    }
}

fn serialize_input(input: &Value) -> String {
    if input.is_null() {
        "{}".to_string()
    } else {
        input.to_string()
    }
}
