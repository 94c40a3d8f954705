//! Per-dialect error envelopes.
//!
//! The same `GatewayError` renders differently depending on which public
//! surface the request came in on: OpenAI callers get
//! `{"error": {"message", "type", "code"}}`, Anthropic callers get
//! `{"type": "error", "error": {"type", "message"}}`.

use axum::{Json, response::IntoResponse};
use serde_json::json;
use tracing::warn;

use super::GatewayError;

/// OpenAI-dialect rendering of a gateway error.
#[derive(Debug)]
pub struct OpenaiFacing(pub GatewayError);

/// Anthropic-dialect rendering of a gateway error.
#[derive(Debug)]
pub struct AnthropicFacing(pub GatewayError);

impl From<GatewayError> for OpenaiFacing {
    fn from(err: GatewayError) -> Self {
        OpenaiFacing(err)
    }
}

impl From<GatewayError> for AnthropicFacing {
    fn from(err: GatewayError) -> Self {
        AnthropicFacing(err)
    }
}

impl IntoResponse for OpenaiFacing {
    fn into_response(self) -> axum::response::Response {
        let status = self.0.status();
        warn!(%status, "request failed: {}", self.0);
        let body = json!({
            "error": {
                "message": self.0.to_string(),
                "type": "kiro_api_error",
                "code": status.as_u16(),
            }
        });
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for AnthropicFacing {
    fn into_response(self) -> axum::response::Response {
        let status = self.0.status();
        warn!(%status, "request failed: {}", self.0);
        let body = json!({
            "type": "error",
            "error": {
                "type": "api_error",
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}
