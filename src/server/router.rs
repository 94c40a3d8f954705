//! Router, shared state, and request-scope middleware.

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderName, StatusCode, Version, header::USER_AGENT},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine as _;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use rand::RngCore;
use reqwest::header::HeaderValue;
use serde_json::json;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use url::Url;

use crate::auth::refresh::RefreshEndpoints;
use crate::auth::{AuthCache, CredentialManager, RefreshCredentials};
use crate::config::Config;
use crate::db::store::TokenStore;
use crate::model_catalog::ModelInfoCache;
use crate::pool::TokenAllocator;
use crate::server::routes;
use crate::upstream::{UpstreamClient, UpstreamEndpoints};

const MAX_REQUEST_ID_LEN: usize = 128;
const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

fn generate_request_id() -> String {
    // 96 bits => 16 chars base64url (no padding).
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn format_http_version(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2",
        Version::HTTP_3 => "HTTP/3",
        _ => "HTTP/?",
    }
}

#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub upstream: Arc<UpstreamClient>,
    pub auth_cache: Arc<AuthCache>,
    /// Single-tenant manager for bare proxy-key callers; absent when neither
    /// `gateway.refresh_token` nor `gateway.creds_file` is configured.
    pub default_manager: Option<Arc<CredentialManager>>,
    pub allocator: Arc<TokenAllocator>,
    pub store: Arc<dyn TokenStore>,
    pub model_cache: Arc<ModelInfoCache>,
    rate_limiter: Option<Arc<DefaultKeyedRateLimiter<String>>>,
}

impl GatewayState {
    pub fn new(config: Config, store: Arc<dyn TokenStore>) -> Self {
        let region = config.gateway.region.clone();
        Self::with_endpoints(
            config,
            store,
            UpstreamEndpoints::for_region(&region),
            Box::new(RefreshEndpoints::for_region),
        )
    }

    /// Test entry: point the upstream API and both refresh dialects at local
    /// mock servers.
    pub fn with_bases(
        config: Config,
        store: Arc<dyn TokenStore>,
        upstream_base: &Url,
        auth_base: &Url,
    ) -> Self {
        let auth_base = auth_base.clone();
        Self::with_endpoints(
            config,
            store,
            UpstreamEndpoints::for_base(upstream_base),
            Box::new(move |_region| RefreshEndpoints::for_base(&auth_base)),
        )
    }

    fn with_endpoints(
        config: Config,
        store: Arc<dyn TokenStore>,
        upstream_endpoints: UpstreamEndpoints,
        refresh_endpoints_for: Box<dyn Fn(&str) -> RefreshEndpoints + Send + Sync>,
    ) -> Self {
        let http = UpstreamClient::build_pool();
        let gateway = &config.gateway;

        let default_manager = if !gateway.refresh_token.is_empty() || !gateway.creds_file.is_empty()
        {
            let creds = RefreshCredentials::social(gateway.refresh_token.clone(), gateway.region.clone())
                .with_profile_arn(Some(gateway.profile_arn.clone()));
            let mut manager = CredentialManager::new(
                creds,
                http.clone(),
                refresh_endpoints_for(&gateway.region),
                gateway.token_refresh_threshold,
            );
            if !gateway.creds_file.is_empty() {
                manager = manager.with_creds_file(gateway.creds_file.clone());
            }
            Some(Arc::new(manager))
        } else {
            None
        };

        let auth_cache = Arc::new(AuthCache::with_endpoints_factory(
            gateway.auth_cache_size,
            gateway.token_refresh_threshold,
            http.clone(),
            refresh_endpoints_for,
        ));

        let upstream = Arc::new(UpstreamClient::new(
            http,
            upstream_endpoints,
            gateway.clone(),
        ));

        let allocator = Arc::new(TokenAllocator::new(store.clone(), auth_cache.clone()));

        let rate_limiter = match NonZeroU32::new(config.basic.rate_limit_per_minute) {
            Some(per_minute) => Some(Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute)))),
            None => None,
        };

        Self {
            config: Arc::new(config),
            upstream,
            auth_cache,
            default_manager,
            allocator,
            store,
            model_cache: Arc::new(ModelInfoCache::new()),
            rate_limiter,
        }
    }
}

async fn not_found_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn access_log(req: Request, next: Next) -> Response {
    // Capture request metadata before moving `req` into the handler stack.
    let method = req.method().clone();
    let uri = req.uri().clone();
    let version = req.version();

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let start = Instant::now();
    let mut resp = next.run(req).await;

    // Always reflect `x-request-id` for easier correlation, even if the client didn't send one.
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(X_REQUEST_ID, value);
    }

    let status = resp.status();
    let latency_ms = start.elapsed().as_millis() as u64;
    let path = uri.path();
    let protocol = format_http_version(version);

    // Note: for SSE/streaming responses, `latency_ms` is time-to-first-byte
    // (handler return), not the full stream duration.
    if status.is_server_error() {
        error!(
            "| {:>3} | {} | {:^7} | {:<8} | {} | {}ms | {}",
            status.as_u16(),
            request_id,
            method.as_str(),
            protocol,
            path,
            latency_ms,
            user_agent
        );
    } else if status.is_client_error() {
        warn!(
            "| {:>3} | {} | {:^7} | {:<8} | {} | {}ms | {}",
            status.as_u16(),
            request_id,
            method.as_str(),
            protocol,
            path,
            latency_ms,
            user_agent
        );
    } else {
        info!(
            "| {:>3} | {} | {:^7} | {:<8} | {} | {}ms | {}",
            status.as_u16(),
            request_id,
            method.as_str(),
            protocol,
            path,
            latency_ms,
            user_agent
        );
    }

    resp
}

/// Per-client rate limit; keyed on forwarded-for when present so the
/// gateway behaves behind a proxy. Disabled when the quota is 0.
async fn rate_limit(
    State(state): State<GatewayState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(limiter) = &state.rate_limiter else {
        return next.run(req).await;
    };

    let client_key = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("local")
        .trim()
        .to_string();

    if limiter.check_key(&client_key).is_err() {
        warn!("Rate limit exceeded for {client_key}");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": {"message": "Rate limit exceeded", "type": "rate_limit_error"}})),
        )
            .into_response();
    }
    next.run(req).await
}

pub fn gateway_router(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(routes::openai::chat_completions))
        .route("/v1/models", get(routes::openai::list_models))
        .route("/v1/messages", post(routes::anthropic::messages))
        .route("/health", get(routes::health))
        .fallback(not_found_handler)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .with_state(state)
        .layer(middleware::from_fn(access_log))
}
