mod chat_request;
mod chat_response;
mod model_list;

pub use chat_request::{ChatCompletionRequest, ChatMessage, Tool, ToolCall, ToolFunction};
pub use chat_response::{
    ChatCompletionChunk, ChatCompletionResponse, Choice, ChunkChoice, ChunkDelta, FunctionCall,
    FunctionCallDelta, ResponseMessage, ToolCallDelta, Usage,
};
pub use model_list::{OpenaiModel, OpenaiModelList};
