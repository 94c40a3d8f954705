use axum::http::StatusCode;
use thiserror::Error as ThisError;

use super::IsRetryable;

#[derive(Debug, ThisError)]
pub enum GatewayError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("API key is invalid or missing")]
    Unauthorized,

    #[error("User is banned")]
    Forbidden,

    #[error("No active token available for this user")]
    NoTokenAvailable,

    #[error("Refresh token is not configured")]
    CredentialMissing,

    /// Terminal 4xx from a refresh endpoint (not 429).
    #[error("Upstream rejected credentials: {status}")]
    AuthRejected { status: StatusCode, body: String },

    /// Non-success upstream status returned to the caller as-is. `body`
    /// holds the extracted reason or a truncated preview, not the raw bytes.
    #[error("Upstream error with status {status}: {body}")]
    UpstreamStatus { status: StatusCode, body: String },

    /// Streaming retry budget exhausted waiting for the first token.
    #[error("Model did not respond within {timeout_secs}s after {attempts} attempts")]
    UpstreamTimeout { timeout_secs: u64, attempts: u32 },

    /// Non-streaming retry budget exhausted.
    #[error("Failed to complete request after {attempts} attempts: {detail}")]
    UpstreamExhausted { attempts: u32, detail: String },

    /// Refresh retries exhausted on transient failures.
    #[error("Upstream auth service unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Malformed upstream payload: refresh response without `accessToken`,
    /// unparseable event-stream frame, a frame that never closed.
    #[error("Upstream protocol violation: {0}")]
    ProtocolViolation(String),

    /// Downstream client went away; never surfaced as a response body.
    #[error("Downstream client disconnected")]
    DownstreamCancelled,

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl GatewayError {
    /// HTTP status surfaced to the caller. Meaningful upstream statuses
    /// (401/403/404/429) are preserved; the rest normalize to a gateway
    /// status.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden => StatusCode::FORBIDDEN,
            GatewayError::NoTokenAvailable | GatewayError::CredentialMissing => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::UpstreamStatus { status, .. } => match *status {
                StatusCode::UNAUTHORIZED
                | StatusCode::FORBIDDEN
                | StatusCode::NOT_FOUND
                | StatusCode::TOO_MANY_REQUESTS => *status,
                s if s.is_client_error() => StatusCode::BAD_REQUEST,
                _ => StatusCode::BAD_GATEWAY,
            },
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::AuthRejected { .. }
            | GatewayError::UpstreamExhausted { .. }
            | GatewayError::UpstreamUnavailable(_)
            | GatewayError::ProtocolViolation(_)
            | GatewayError::Reqwest(_)
            | GatewayError::Json(_) => StatusCode::BAD_GATEWAY,
            GatewayError::DownstreamCancelled
            | GatewayError::Io(_)
            | GatewayError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IsRetryable for GatewayError {
    fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Reqwest(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            GatewayError::UpstreamStatus { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            _ => false,
        }
    }
}
