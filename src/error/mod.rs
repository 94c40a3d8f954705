mod envelope;
mod gateway;

pub use envelope::{AnthropicFacing, OpenaiFacing};
pub use gateway::GatewayError;

pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}
