pub mod anthropic;
pub mod codewhisperer;
pub mod content;
pub mod openai;

pub use anthropic::{
    AnthropicMessage, AnthropicTool, AnthropicToolChoice, AnthropicUsage, MessagesRequest,
    MessagesResponse, SystemPrompt, ThinkingConfig,
};
pub use codewhisperer::{
    AssistantResponseMessage, ConversationRequest, ConversationState, ConversationTurn,
    CurrentMessage, InputSchema, ToolResultContent, ToolResultEntry, ToolSpecification,
    ToolSpecificationEntry, ToolUseEntry, UserInputMessage, UserInputMessageContext,
};
pub use content::{ContentBlock, ImageSource, ImageUrl, MessageContent};
pub use openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice,
    ChunkChoice, ChunkDelta, FunctionCall, FunctionCallDelta, OpenaiModel, OpenaiModelList,
    ResponseMessage, Tool, ToolCall, ToolCallDelta, ToolFunction, Usage,
};
