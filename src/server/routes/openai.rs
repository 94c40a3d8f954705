//! `/v1/chat/completions` and `/v1/models` — the OpenAI-compatible surface.

use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tracing::{info, warn};

use super::{OpenaiJson, call_upstream, upstream_status_error};
use crate::error::{GatewayError, OpenaiFacing};
use crate::model_catalog::AVAILABLE_MODELS;
use crate::respond;
use crate::server::guards::OpenaiAuth;
use crate::server::router::GatewayState;
use crate::tokenizer::estimate_request_tokens;
use crate::translate::build_conversation_request;
use crate::upstream::UpstreamReply;
use crate::utils::ids::generate_conversation_id;
use kirogate_schema::{ChatCompletionRequest, OpenaiModelList};

pub async fn chat_completions(
    State(state): State<GatewayState>,
    OpenaiAuth(auth): OpenaiAuth,
    OpenaiJson(request): OpenaiJson<ChatCompletionRequest>,
) -> Result<Response, OpenaiFacing> {
    info!(
        model = %request.model,
        stream = request.stream,
        "Received /v1/chat/completions request"
    );
    if request.messages.is_empty() {
        return Err(OpenaiFacing(GatewayError::BadRequest(
            "messages must not be empty".to_string(),
        )));
    }

    let input_tokens =
        estimate_request_tokens(&request.messages, request.tools.as_deref(), None);

    let profile_arn = auth.manager.profile_arn().await;
    let payload = build_conversation_request(
        &request,
        generate_conversation_id(),
        profile_arn.as_deref(),
        state.config.gateway.tool_description_max_length,
    )
    .map_err(OpenaiFacing)?;

    let reply = call_upstream(&state, &auth, &payload, request.stream, &request.model)
        .await
        .map_err(OpenaiFacing)?;

    if !reply.status().is_success() {
        return Err(OpenaiFacing(upstream_status_error(&reply)));
    }

    match reply {
        UpstreamReply::Streaming(upstream) => Ok(respond::openai::build_stream_response(
            upstream,
            request.model.clone(),
            input_tokens,
        )
        .into_response()),
        UpstreamReply::Buffered { body, .. } => {
            let completion =
                respond::openai::build_json_response(&body, &request.model, input_tokens)
                    .map_err(OpenaiFacing)?;
            Ok(Json(completion).into_response())
        }
    }
}

pub async fn list_models(
    State(state): State<GatewayState>,
    OpenaiAuth(auth): OpenaiAuth,
) -> Json<OpenaiModelList> {
    info!("Received /v1/models request");

    // Serve the static catalog immediately; freshen upstream metadata in the
    // background when stale.
    if state.model_cache.is_stale() {
        let manager = auth.manager.clone();
        let upstream = state.upstream.clone();
        let cache = state.model_cache.clone();
        tokio::spawn(async move {
            match upstream.list_available_models(&manager).await {
                Ok(body) => cache.update(&body),
                Err(e) => warn!("Model cache refresh failed: {e}"),
            }
        });
    }

    Json(OpenaiModelList::from_model_names(
        AVAILABLE_MODELS.iter().copied(),
        "anthropic",
        Utc::now().timestamp(),
    ))
}
