//! OpenAI-shape request -> CodeWhisperer conversation payload.
//!
//! The upstream rejects payloads with consecutive same-role turns and with
//! tool results that reference unknown tool uses, so the builder first
//! rewrites tool-role messages into user turns, merges adjacent same-role
//! messages (concatenating assistant `tool_calls` in the process), and only
//! then splits history from the current turn.

use serde_json::{Value, json};
use tracing::debug;

use crate::error::GatewayError;
use crate::model_catalog::internal_model_id;
use crate::translate::content::{extract_text, extract_text_value};
use kirogate_schema::{
    AssistantResponseMessage, ChatCompletionRequest, ChatMessage, ContentBlock,
    ConversationRequest, ConversationState, ConversationTurn, CurrentMessage, InputSchema,
    MessageContent, Tool, ToolFunction, ToolResultContent, ToolResultEntry, ToolSpecification,
    ToolSpecificationEntry, ToolUseEntry, UserInputMessage, UserInputMessageContext,
};

const CONTINUE_CONTENT: &str = "Continue";
const EMPTY_TOOL_RESULT: &str = "(empty result)";

/// Hoist over-long tool descriptions into a system-prompt documentation
/// section, leaving a reference pointer in the tool itself. Returns the
/// processed tools and the documentation text to append to the system
/// prompt (empty when nothing was hoisted). `max_length == 0` disables.
pub fn process_tool_descriptions(
    tools: Option<&[Tool]>,
    max_length: usize,
) -> (Option<Vec<Tool>>, String) {
    let Some(tools) = tools else {
        return (None, String::new());
    };
    if max_length == 0 {
        return (Some(tools.to_vec()), String::new());
    }

    let mut documentation_parts: Vec<String> = Vec::new();
    let mut processed: Vec<Tool> = Vec::with_capacity(tools.len());

    for tool in tools {
        if tool.kind != "function" {
            processed.push(tool.clone());
            continue;
        }
        let description = tool.function.description.clone().unwrap_or_default();
        if description.len() <= max_length {
            processed.push(tool.clone());
            continue;
        }

        let name = &tool.function.name;
        debug!(
            "Tool '{name}' has long description ({} chars > {max_length}), moving to system prompt",
            description.len()
        );
        documentation_parts.push(format!("## Tool: {name}\n\n{description}"));

        processed.push(Tool {
            kind: tool.kind.clone(),
            function: ToolFunction {
                name: tool.function.name.clone(),
                description: Some(format!(
                    "[Full documentation in system prompt under '## Tool: {name}']"
                )),
                parameters: tool.function.parameters.clone(),
            },
        });
    }

    let documentation = if documentation_parts.is_empty() {
        String::new()
    } else {
        format!(
            "\n\n---\n# Tool Documentation\nThe following tools have detailed documentation that couldn't fit in the tool definition.\n\n{}",
            documentation_parts.join("\n\n---\n\n")
        )
    };

    let processed = if processed.is_empty() {
        None
    } else {
        Some(processed)
    };
    (processed, documentation)
}

/// Rewrite tool-role messages into user turns carrying `tool_result` blocks,
/// then coalesce adjacent same-role messages. Assistant merges concatenate
/// `tool_calls`; dropping them would orphan later tool results and the
/// upstream rejects the payload.
pub fn merge_adjacent_messages(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    if messages.is_empty() {
        return Vec::new();
    }

    // Pass 1: tool role -> user message with tool_result blocks.
    let mut processed: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    let mut pending_results: Vec<ContentBlock> = Vec::new();

    for message in messages {
        if message.role == "tool" {
            let text = extract_text(message.content.as_ref());
            pending_results.push(ContentBlock::ToolResult {
                tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                content: Value::String(if text.is_empty() {
                    EMPTY_TOOL_RESULT.to_string()
                } else {
                    text
                }),
                is_error: None,
            });
            continue;
        }
        if !pending_results.is_empty() {
            processed.push(ChatMessage::new(
                "user",
                MessageContent::Blocks(std::mem::take(&mut pending_results)),
            ));
        }
        processed.push(message);
    }
    if !pending_results.is_empty() {
        processed.push(ChatMessage::new(
            "user",
            MessageContent::Blocks(pending_results),
        ));
    }

    // Pass 2: coalesce adjacent same-role messages.
    let mut merged: Vec<ChatMessage> = Vec::with_capacity(processed.len());
    for message in processed {
        let Some(last) = merged.last_mut().filter(|last| last.role == message.role) else {
            merged.push(message);
            continue;
        };

        last.content = Some(merge_content(
            last.content.take().unwrap_or_default(),
            message.content.unwrap_or_default(),
        ));

        if message.role == "assistant" {
            if let Some(incoming) = message.tool_calls {
                let total = last.tool_calls.get_or_insert_with(Vec::new);
                debug!(
                    "Merged tool_calls: added {}, total now: {}",
                    incoming.len(),
                    total.len() + incoming.len()
                );
                total.extend(incoming);
            }
        }
    }
    merged
}

fn merge_content(last: MessageContent, next: MessageContent) -> MessageContent {
    match (last, next) {
        (MessageContent::Blocks(mut a), MessageContent::Blocks(b)) => {
            a.extend(b);
            MessageContent::Blocks(a)
        }
        (MessageContent::Blocks(mut a), text @ MessageContent::Text(_)) => {
            a.push(ContentBlock::text(extract_text(Some(&text))));
            MessageContent::Blocks(a)
        }
        (text @ MessageContent::Text(_), MessageContent::Blocks(b)) => {
            let mut blocks = vec![ContentBlock::text(extract_text(Some(&text)))];
            blocks.extend(b);
            MessageContent::Blocks(blocks)
        }
        (MessageContent::Text(a), MessageContent::Text(b)) => {
            MessageContent::Text(format!("{a}\n{b}"))
        }
    }
}

fn extract_tool_results(content: Option<&MessageContent>) -> Vec<ToolResultEntry> {
    let Some(MessageContent::Blocks(blocks)) = content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => Some(ToolResultEntry {
                content: vec![ToolResultContent {
                    text: extract_text_value(content),
                }],
                status: "success".to_string(),
                tool_use_id: tool_use_id.clone(),
            }),
            _ => None,
        })
        .collect()
}

fn extract_tool_uses(message: &ChatMessage) -> Vec<ToolUseEntry> {
    let mut tool_uses = Vec::new();

    if let Some(tool_calls) = &message.tool_calls {
        for tc in tool_calls {
            tool_uses.push(ToolUseEntry {
                name: tc.function.name.clone(),
                input: serde_json::from_str(&tc.function.arguments).unwrap_or_else(|_| json!({})),
                tool_use_id: tc.id.clone(),
            });
        }
    }
    if let Some(MessageContent::Blocks(blocks)) = &message.content {
        for block in blocks {
            if let ContentBlock::ToolUse { id, name, input } = block {
                tool_uses.push(ToolUseEntry {
                    name: name.clone(),
                    input: input.clone(),
                    tool_use_id: id.clone(),
                });
            }
        }
    }
    tool_uses
}

fn prepend_system(content: &mut MessageContent, system_prompt: &str) {
    match content {
        MessageContent::Text(text) => {
            *text = format!("{system_prompt}\n\n{text}");
        }
        MessageContent::Blocks(blocks) => {
            blocks.insert(0, ContentBlock::text(format!("{system_prompt}\n\n")));
        }
    }
}

fn history_turn(message: &ChatMessage, model_id: &str) -> Option<ConversationTurn> {
    match message.role.as_str() {
        "user" => {
            let tool_results = extract_tool_results(message.content.as_ref());
            let context = (!tool_results.is_empty()).then(|| UserInputMessageContext {
                tools: None,
                tool_results: Some(tool_results),
            });
            Some(ConversationTurn::UserInputMessage(UserInputMessage {
                content: extract_text(message.content.as_ref()),
                model_id: model_id.to_string(),
                origin: "AI_EDITOR".to_string(),
                user_input_message_context: context,
            }))
        }
        "assistant" => {
            let tool_uses = extract_tool_uses(message);
            Some(ConversationTurn::AssistantResponseMessage(
                AssistantResponseMessage {
                    content: extract_text(message.content.as_ref()),
                    tool_uses: (!tool_uses.is_empty()).then_some(tool_uses),
                },
            ))
        }
        _ => None,
    }
}

/// Build the full upstream payload for one chat-completion request.
pub fn build_conversation_request(
    request: &ChatCompletionRequest,
    conversation_id: String,
    profile_arn: Option<&str>,
    tool_description_max_length: usize,
) -> Result<ConversationRequest, GatewayError> {
    let (processed_tools, tool_documentation) =
        process_tool_descriptions(request.tools.as_deref(), tool_description_max_length);

    // Extract the system prompt; system messages leave the flow entirely.
    let mut system_prompt = String::new();
    let mut non_system: Vec<ChatMessage> = Vec::with_capacity(request.messages.len());
    for message in request.messages.clone() {
        if message.role == "system" {
            system_prompt.push_str(&extract_text(message.content.as_ref()));
            system_prompt.push('\n');
        } else {
            non_system.push(message);
        }
    }
    let mut system_prompt = system_prompt.trim().to_string();
    if !tool_documentation.is_empty() {
        if system_prompt.is_empty() {
            system_prompt = tool_documentation.trim().to_string();
        } else {
            system_prompt.push_str(&tool_documentation);
        }
    }

    let mut merged = merge_adjacent_messages(non_system);
    if merged.is_empty() {
        return Err(GatewayError::BadRequest("no messages to send".to_string()));
    }

    let model_id = internal_model_id(&request.model);

    let current = merged.pop().expect("merged is non-empty");
    let mut history_messages = merged;

    // The system prompt never becomes a standalone turn: it rides on the
    // first user turn of history, or on the current message when there is
    // no history.
    if !system_prompt.is_empty() {
        if let Some(first) = history_messages.first_mut().filter(|m| m.role == "user") {
            let mut content = first.content.take().unwrap_or_default();
            prepend_system(&mut content, &system_prompt);
            first.content = Some(content);
        }
    }

    let mut history: Vec<ConversationTurn> = history_messages
        .iter()
        .filter_map(|m| history_turn(m, model_id))
        .collect();

    let mut current_content = extract_text(current.content.as_ref());
    if !system_prompt.is_empty() && history.is_empty() {
        current_content = format!("{system_prompt}\n\n{current_content}");
    }

    // An assistant-final conversation is continued on the model's behalf.
    if current.role == "assistant" {
        let tool_uses = extract_tool_uses(&current);
        history.push(ConversationTurn::AssistantResponseMessage(
            AssistantResponseMessage {
                content: current_content,
                tool_uses: (!tool_uses.is_empty()).then_some(tool_uses),
            },
        ));
        current_content = CONTINUE_CONTENT.to_string();
    }
    if current_content.is_empty() {
        current_content = CONTINUE_CONTENT.to_string();
    }

    let tools = processed_tools.map(|tools| {
        tools
            .iter()
            .filter(|t| t.kind == "function")
            .map(|tool| ToolSpecificationEntry {
                tool_specification: ToolSpecification {
                    name: tool.function.name.clone(),
                    description: tool.function.description.clone().unwrap_or_default(),
                    input_schema: InputSchema {
                        json: tool
                            .function
                            .parameters
                            .clone()
                            .unwrap_or_else(|| json!({})),
                    },
                },
            })
            .collect::<Vec<_>>()
    });
    let tool_results = extract_tool_results(current.content.as_ref());

    let mut context = UserInputMessageContext::default();
    if let Some(tools) = tools.filter(|t| !t.is_empty()) {
        context.tools = Some(tools);
    }
    if !tool_results.is_empty() {
        context.tool_results = Some(tool_results);
    }

    let user_input_message = UserInputMessage {
        content: current_content,
        model_id: model_id.to_string(),
        origin: "AI_EDITOR".to_string(),
        user_input_message_context: (!context.is_empty()).then_some(context),
    };

    Ok(ConversationRequest {
        conversation_state: ConversationState {
            chat_trigger_type: "MANUAL".to_string(),
            conversation_id,
            current_message: CurrentMessage { user_input_message },
            history: (!history.is_empty()).then_some(history),
        },
        profile_arn: profile_arn.map(str::to_string),
    })
}
