pub mod anthropic;
pub mod openai;

use axum::{
    Json,
    extract::{FromRequest, Request, State},
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::error::{AnthropicFacing, GatewayError, OpenaiFacing};
use crate::server::guards::RequestAuth;
use crate::server::router::GatewayState;
use crate::upstream::{UPSTREAM_BODY_PREVIEW_CHARS, UpstreamReply};
use kirogate_schema::ConversationRequest;

/// JSON body extractor rejecting in the OpenAI error envelope.
pub struct OpenaiJson<T>(pub T);

impl<S, T> FromRequest<S> for OpenaiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = OpenaiFacing;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(OpenaiJson(value)),
            Err(rejection) => Err(OpenaiFacing(GatewayError::BadRequest(
                rejection.body_text(),
            ))),
        }
    }
}

/// JSON body extractor rejecting in the Anthropic error envelope.
pub struct AnthropicJson<T>(pub T);

impl<S, T> FromRequest<S> for AnthropicJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = AnthropicFacing;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AnthropicJson(value)),
            Err(rejection) => Err(AnthropicFacing(GatewayError::BadRequest(
                rejection.body_text(),
            ))),
        }
    }
}

/// Call the upstream and settle donated-token accounting on the outcome.
pub(super) async fn call_upstream(
    state: &GatewayState,
    auth: &RequestAuth,
    payload: &ConversationRequest,
    stream: bool,
    model: &str,
) -> Result<UpstreamReply, GatewayError> {
    let result = state
        .upstream
        .generate_assistant_response(&auth.manager, payload, stream, model)
        .await;

    if let Some(token_id) = auth.donated_token_id {
        let success = matches!(&result, Ok(reply) if reply.status().is_success());
        state.allocator.report(token_id, success).await;
        if let Err(error) = &result {
            state.allocator.handle_auth_failure(token_id, error).await;
        }
    }
    result
}

/// Error for a buffered non-success upstream reply, surfacing the upstream's
/// own `reason`/`message` when the body carries one.
pub(super) fn upstream_status_error(reply: &UpstreamReply) -> GatewayError {
    let (status, body) = match reply {
        UpstreamReply::Buffered { status, body } => (*status, body.as_slice()),
        UpstreamReply::Streaming(resp) => (resp.status(), &[] as &[u8]),
    };

    let text = String::from_utf8_lossy(body);
    let reason = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| {
            ["reason", "message"]
                .iter()
                .find_map(|key| v.get(key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| text.chars().take(UPSTREAM_BODY_PREVIEW_CHARS).collect());

    GatewayError::UpstreamStatus {
        status,
        body: reason,
    }
}

/// Detailed health check: token state plus model-cache freshness.
pub async fn health(State(state): State<GatewayState>) -> Json<Value> {
    let token_valid = match &state.default_manager {
        Some(manager) => manager.has_fresh_token().await,
        None => false,
    };

    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "token_valid": token_valid,
        "model_cache_size": state.model_cache.size(),
        "model_cache_last_update": state.model_cache.last_update_unix(),
    }))
}
