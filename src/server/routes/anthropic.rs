//! `/v1/messages` — the Anthropic-compatible surface.

use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Response},
};
use tracing::info;

use super::{AnthropicJson, call_upstream, upstream_status_error};
use crate::error::{AnthropicFacing, GatewayError};
use crate::respond;
use crate::server::guards::AnthropicAuth;
use crate::server::router::GatewayState;
use crate::tokenizer::estimate_request_tokens;
use crate::translate::{build_conversation_request, to_chat_completion_request};
use crate::upstream::UpstreamReply;
use crate::utils::ids::generate_conversation_id;
use kirogate_schema::MessagesRequest;

pub async fn messages(
    State(state): State<GatewayState>,
    AnthropicAuth(auth): AnthropicAuth,
    AnthropicJson(request): AnthropicJson<MessagesRequest>,
) -> Result<Response, AnthropicFacing> {
    info!(
        model = %request.model,
        stream = request.stream,
        "Received /v1/messages request"
    );
    if request.messages.is_empty() {
        return Err(AnthropicFacing(GatewayError::BadRequest(
            "messages must not be empty".to_string(),
        )));
    }

    let thinking_enabled = request.thinking_enabled();
    let internal = to_chat_completion_request(&request);

    let input_tokens =
        estimate_request_tokens(&internal.messages, internal.tools.as_deref(), None);

    let profile_arn = auth.manager.profile_arn().await;
    let payload = build_conversation_request(
        &internal,
        generate_conversation_id(),
        profile_arn.as_deref(),
        state.config.gateway.tool_description_max_length,
    )
    .map_err(AnthropicFacing)?;

    let reply = call_upstream(&state, &auth, &payload, request.stream, &request.model)
        .await
        .map_err(AnthropicFacing)?;

    if !reply.status().is_success() {
        return Err(AnthropicFacing(upstream_status_error(&reply)));
    }

    match reply {
        UpstreamReply::Streaming(upstream) => Ok(respond::anthropic::build_stream_response(
            upstream,
            request.model.clone(),
            input_tokens,
            thinking_enabled,
        )
        .into_response()),
        UpstreamReply::Buffered { body, .. } => {
            let message = respond::anthropic::build_json_response(
                &body,
                &request.model,
                input_tokens,
                thinking_enabled,
            )
            .map_err(AnthropicFacing)?;
            Ok(Json(message).into_response())
        }
    }
}
