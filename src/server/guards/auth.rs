//! Inbound API-key verification for both public dialects.
//!
//! Three key forms are accepted:
//! 1. `<proxy_api_key>` — single-tenant; uses the default credential manager
//! 2. `<proxy_api_key>:<refresh_token>` — per-request tenant routing through
//!    the auth cache
//! 3. `sk-<hex>` — persisted user API key; routed through the donated-token
//!    allocator
//!
//! OpenAI callers authenticate with `Authorization: Bearer`; Anthropic
//! callers prefer `x-api-key` but the bearer form is accepted there too.

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, request::Parts},
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::auth::{CredentialManager, RefreshCredentials};
use crate::error::{AnthropicFacing, GatewayError, OpenaiFacing};
use crate::server::router::GatewayState;
use crate::utils::logging::mask_token;

/// Resolved identity for one request.
pub struct RequestAuth {
    pub manager: Arc<CredentialManager>,
    /// Set when the request came in on a user API key; drives usage
    /// accounting after completion.
    pub donated_token_id: Option<i64>,
    pub user_id: Option<i64>,
}

async fn resolve_key(state: &GatewayState, key: &str) -> Result<RequestAuth, GatewayError> {
    if key.starts_with("sk-") {
        return resolve_user_key(state, key).await;
    }

    let proxy_key = state.config.basic.proxy_api_key.as_bytes();

    if let Some((presented, refresh_token)) = key.split_once(':') {
        if !bool::from(presented.as_bytes().ct_eq(proxy_key)) {
            warn!("Invalid proxy key in multi-tenant auth: {}", mask_token(presented));
            return Err(GatewayError::Unauthorized);
        }
        debug!(
            "Multi-tenant auth with refresh token {}",
            mask_token(refresh_token)
        );
        let creds = RefreshCredentials::social(
            refresh_token.to_string(),
            state.config.gateway.region.clone(),
        )
        .with_profile_arn(Some(state.config.gateway.profile_arn.clone()));
        let manager = state.auth_cache.get_or_create(creds).await;
        return Ok(RequestAuth {
            manager,
            donated_token_id: None,
            user_id: None,
        });
    }

    if !bool::from(key.as_bytes().ct_eq(proxy_key)) {
        warn!("Invalid API key");
        return Err(GatewayError::Unauthorized);
    }
    let manager = state
        .default_manager
        .clone()
        .ok_or(GatewayError::CredentialMissing)?;
    Ok(RequestAuth {
        manager,
        donated_token_id: None,
        user_id: None,
    })
}

async fn resolve_user_key(state: &GatewayState, key: &str) -> Result<RequestAuth, GatewayError> {
    let Some((user_id, _api_key)) = state.store.verify_user_api_key(key).await? else {
        warn!("Invalid user API key: {}", mask_token(key));
        return Err(GatewayError::Unauthorized);
    };

    let banned = state
        .store
        .get_user(user_id)
        .await?
        .is_none_or(|user| user.is_banned);
    if banned {
        warn!("Banned user attempted API access: user_id={user_id}");
        return Err(GatewayError::Forbidden);
    }

    let (token, manager) = state.allocator.best_token_for(user_id).await?;
    debug!("User API key auth: user_id={user_id}, token_id={}", token.id);
    Ok(RequestAuth {
        manager,
        donated_token_id: Some(token.id),
        user_id: Some(user_id),
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string())
}

/// `Authorization: Bearer` auth, rejecting in the OpenAI envelope.
pub struct OpenaiAuth(pub RequestAuth);

impl FromRequestParts<GatewayState> for OpenaiAuth {
    type Rejection = OpenaiFacing;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &GatewayState,
    ) -> Result<Self, Self::Rejection> {
        let Some(key) = bearer_token(&parts.headers) else {
            warn!("Missing or malformed Authorization header");
            return Err(OpenaiFacing(GatewayError::Unauthorized));
        };
        let auth = resolve_key(state, &key).await.map_err(OpenaiFacing)?;
        Ok(OpenaiAuth(auth))
    }
}

/// `x-api-key` (preferred) or bearer auth, rejecting in the Anthropic
/// envelope.
pub struct AnthropicAuth(pub RequestAuth);

impl FromRequestParts<GatewayState> for AnthropicAuth {
    type Rejection = AnthropicFacing;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &GatewayState,
    ) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| bearer_token(&parts.headers));

        let Some(key) = key else {
            warn!("Missing API key on Anthropic endpoint");
            return Err(AnthropicFacing(GatewayError::Unauthorized));
        };
        let auth = resolve_key(state, &key).await.map_err(AnthropicFacing)?;
        Ok(AnthropicAuth(auth))
    }
}
