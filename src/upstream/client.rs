//! Retrying HTTP client for the CodeWhisperer API.
//!
//! The retry policy treats statuses differently, so this is a hand-rolled
//! attempt loop rather than a uniform-predicate retry combinator:
//! - 403: force a token refresh and retry without consuming backoff budget
//! - 429 / 5xx: exponential backoff, then retry
//! - timeout: streaming retries immediately (first-token timeout),
//!   non-streaming backs off
//! - transport errors: backoff, then retry
//! - anything else: returned to the caller as-is

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::CredentialManager;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::upstream::UPSTREAM_BODY_PREVIEW_CHARS;
use crate::upstream::endpoints::UpstreamEndpoints;
use crate::utils::fingerprint::gateway_user_agent;
use kirogate_schema::ConversationRequest;

const AMZ_USER_AGENT: &str = "aws-sdk-js/1.0.7 KiroIDE";
/// Cap on free 403-triggered refresh retries per request.
const MAX_AUTH_RETRIES: u32 = 2;

/// Result of a successful (or pass-through) upstream exchange.
pub enum UpstreamReply {
    /// 200 with the body still open; the caller owns draining/closing it.
    Streaming(reqwest::Response),
    /// Fully drained body (non-streaming 200, or a non-retryable status).
    Buffered { status: StatusCode, body: Vec<u8> },
}

impl UpstreamReply {
    pub fn status(&self) -> StatusCode {
        match self {
            UpstreamReply::Streaming(resp) => resp.status(),
            UpstreamReply::Buffered { status, .. } => *status,
        }
    }
}

pub struct UpstreamClient {
    http: reqwest::Client,
    endpoints: UpstreamEndpoints,
    cfg: GatewayConfig,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, endpoints: UpstreamEndpoints, cfg: GatewayConfig) -> Self {
        Self {
            http,
            endpoints,
            cfg,
        }
    }

    /// Build the process-wide upstream connection pool.
    pub fn build_pool() -> reqwest::Client {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build reqwest client")
    }

    fn headers(access_token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {access_token}")) {
            headers.insert(AUTHORIZATION, value);
        }
        if let Ok(value) = HeaderValue::from_str(&gateway_user_agent()) {
            headers.insert(USER_AGENT, value);
        }
        headers.insert("x-amz-user-agent", HeaderValue::from_static(AMZ_USER_AGENT));
        headers
    }

    fn attempt_timeout(&self, stream: bool, model: &str) -> Duration {
        let base = if stream {
            self.cfg.first_token_timeout
        } else {
            self.cfg.non_stream_timeout
        };
        Duration::from_secs_f64(base as f64 * self.cfg.timeout_multiplier(model))
    }

    /// POST the conversation payload with the full retry policy applied.
    pub async fn generate_assistant_response(
        &self,
        manager: &CredentialManager,
        payload: &ConversationRequest,
        stream: bool,
        model: &str,
    ) -> Result<UpstreamReply, GatewayError> {
        let timeout = self.attempt_timeout(stream, model);
        let max_attempts = if stream {
            self.cfg.first_token_max_retries
        } else {
            self.cfg.max_retries
        };

        let mut attempt: u32 = 0;
        let mut auth_retries: u32 = 0;
        let mut last_error: Option<GatewayError> = None;

        while attempt < max_attempts {
            let token = manager.get_access_token().await?;
            let request = self
                .http
                .post(self.endpoints.generate_url().clone())
                .headers(Self::headers(&token))
                .json(payload);

            match tokio::time::timeout(timeout, request.send()).await {
                Ok(Ok(resp)) => {
                    let status = resp.status();

                    if status.is_success() {
                        if stream {
                            return Ok(UpstreamReply::Streaming(resp));
                        }
                        let body = resp.bytes().await?.to_vec();
                        return Ok(UpstreamReply::Buffered { status, body });
                    }

                    if status == StatusCode::FORBIDDEN {
                        auth_retries += 1;
                        if auth_retries > MAX_AUTH_RETRIES {
                            let body = resp.bytes().await.unwrap_or_default().to_vec();
                            return Ok(UpstreamReply::Buffered { status, body });
                        }
                        warn!(
                            "Received 403, refreshing token (auth retry {auth_retries}/{MAX_AUTH_RETRIES})"
                        );
                        manager.force_refresh().await?;
                        // Refresh retries are free: do not consume an attempt.
                        continue;
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        let body = resp.bytes().await.unwrap_or_default();
                        let preview: String = String::from_utf8_lossy(&body)
                            .chars()
                            .take(UPSTREAM_BODY_PREVIEW_CHARS)
                            .collect();
                        let delay = self.backoff_delay(attempt);
                        warn!(
                            %status,
                            body = %preview,
                            "Upstream error, waiting {delay:?} (attempt {}/{max_attempts})",
                            attempt + 1
                        );
                        last_error = Some(GatewayError::UpstreamStatus {
                            status,
                            body: preview,
                        });
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    // Other statuses are the caller's problem.
                    let body = resp.bytes().await.unwrap_or_default().to_vec();
                    return Ok(UpstreamReply::Buffered { status, body });
                }
                Ok(Err(e)) => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "Request error: {e}, waiting {delay:?} (attempt {}/{max_attempts})",
                        attempt + 1
                    );
                    last_error = Some(e.into());
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(_elapsed) => {
                    if stream {
                        // First-token timeout: retry immediately.
                        warn!(
                            "First token timeout after {timeout:?} (attempt {}/{max_attempts})",
                            attempt + 1
                        );
                    } else {
                        let delay = self.backoff_delay(attempt);
                        warn!(
                            "Timeout, waiting {delay:?} (attempt {}/{max_attempts})",
                            attempt + 1
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(GatewayError::UpstreamTimeout {
                        timeout_secs: timeout.as_secs(),
                        attempts: attempt + 1,
                    });
                    attempt += 1;
                }
            }
        }

        debug!("Upstream retry budget exhausted after {max_attempts} attempts");
        if stream {
            Err(GatewayError::UpstreamTimeout {
                timeout_secs: timeout.as_secs(),
                attempts: max_attempts,
            })
        } else {
            Err(GatewayError::UpstreamExhausted {
                attempts: max_attempts,
                detail: last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no upstream response".to_string()),
            })
        }
    }

    /// Fetch the upstream model catalog; callers treat failures as stale-cache.
    pub async fn list_available_models(
        &self,
        manager: &CredentialManager,
    ) -> Result<serde_json::Value, GatewayError> {
        let token = manager.get_access_token().await?;
        let profile_arn = manager.profile_arn().await;
        let url = self.endpoints.models_url(profile_arn.as_deref());

        let resp = self
            .http
            .get(url)
            .headers(Self::headers(&token))
            .timeout(Duration::from_secs(30))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamStatus { status, body });
        }
        Ok(resp.json().await?)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_secs_f64(self.cfg.base_retry_delay * f64::from(1u32 << attempt.min(16)))
    }
}
