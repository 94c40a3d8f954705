pub mod auth;

pub use auth::{AnthropicAuth, OpenaiAuth, RequestAuth};
