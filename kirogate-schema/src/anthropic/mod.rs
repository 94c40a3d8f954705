mod messages_request;
mod messages_response;

pub use messages_request::{
    AnthropicMessage, AnthropicTool, AnthropicToolChoice, MessagesRequest, SystemPrompt,
    ThinkingConfig,
};
pub use messages_response::{AnthropicUsage, MessagesResponse};
