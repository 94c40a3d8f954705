mod conversation;

pub use conversation::{
    AssistantResponseMessage, ConversationRequest, ConversationState, ConversationTurn,
    CurrentMessage, InputSchema, ToolResultContent, ToolResultEntry, ToolSpecification,
    ToolSpecificationEntry, ToolUseEntry, UserInputMessage, UserInputMessageContext,
};
