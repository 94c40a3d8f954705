//! Refresh-token exchange against the two auth dialects.
//!
//! Social accounts refresh against the Kiro desktop auth host; OIDC accounts
//! refresh against the AWS SSO OIDC token endpoint with their client pair.
//! Both return `accessToken` / `refreshToken?` / `expiresIn` / `profileArn?`.

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::warn;
use url::Url;

use crate::auth::credentials::{AuthKind, RefreshCredentials};
use crate::error::{GatewayError, IsRetryable};
use crate::utils::fingerprint::gateway_user_agent;

/// Seconds shaved off the server-reported expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

static REFRESH_RETRY_POLICY: LazyLock<ExponentialBuilder> = LazyLock::new(|| {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(4))
        .with_max_times(2)
});

/// Refresh endpoints for one region, overridable for tests.
#[derive(Debug, Clone)]
pub struct RefreshEndpoints {
    social: Url,
    oidc: Url,
}

impl RefreshEndpoints {
    pub fn for_region(region: &str) -> Self {
        let social = Url::parse(&format!(
            "https://prod.{region}.auth.desktop.kiro.dev/refreshToken"
        ))
        .expect("invalid social refresh URL for region");
        let oidc = Url::parse(&format!("https://oidc.{region}.amazonaws.com/token"))
            .expect("invalid OIDC refresh URL for region");
        Self { social, oidc }
    }

    /// Point both dialects at a local test server.
    pub fn for_base(base: &Url) -> Self {
        let join = |path: &str| base.join(path).expect("invalid test base URL");
        Self {
            social: join("/refreshToken"),
            oidc: join("/token"),
        }
    }

    fn select(&self, kind: AuthKind) -> &Url {
        match kind {
            AuthKind::Social => &self.social,
            AuthKind::Oidc => &self.oidc,
        }
    }
}

/// Parsed refresh response with the expiry skew already applied.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub profile_arn: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponseBody {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    profile_arn: Option<String>,
}

async fn refresh_once(
    client: &reqwest::Client,
    endpoints: &RefreshEndpoints,
    creds: &RefreshCredentials,
) -> Result<RefreshedToken, GatewayError> {
    let body = match creds.auth_kind {
        AuthKind::Social => json!({ "refreshToken": creds.refresh_token }),
        AuthKind::Oidc => {
            let client_id = creds
                .client_id
                .as_deref()
                .ok_or(GatewayError::CredentialMissing)?;
            let client_secret = creds
                .client_secret
                .as_deref()
                .ok_or(GatewayError::CredentialMissing)?;
            json!({
                "clientId": client_id,
                "clientSecret": client_secret,
                "grantType": "refresh_token",
                "refreshToken": creds.refresh_token,
            })
        }
    };

    let resp = client
        .post(endpoints.select(creds.auth_kind).clone())
        .header(reqwest::header::USER_AGENT, gateway_user_agent())
        .json(&body)
        .timeout(Duration::from_secs(30))
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(GatewayError::UpstreamStatus { status, body });
        }
        return Err(GatewayError::AuthRejected { status, body });
    }

    let parsed: RefreshResponseBody = resp.json().await?;
    let access_token = parsed
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            GatewayError::ProtocolViolation("refresh response does not contain accessToken".into())
        })?;

    let expires_in = parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
    let expires_at = Utc::now() + ChronoDuration::seconds(expires_in - EXPIRY_SKEW_SECS);

    Ok(RefreshedToken {
        access_token,
        refresh_token: parsed.refresh_token.filter(|t| !t.is_empty()),
        expires_at,
        profile_arn: parsed.profile_arn.filter(|p| !p.is_empty()),
    })
}

/// Refresh with up to three attempts; 429/5xx/transport errors back off
/// exponentially, terminal 4xx fails immediately as `AuthRejected`.
pub async fn refresh_with_retry(
    client: &reqwest::Client,
    endpoints: &RefreshEndpoints,
    creds: &RefreshCredentials,
) -> Result<RefreshedToken, GatewayError> {
    (|| async { refresh_once(client, endpoints, creds).await })
        .retry(*REFRESH_RETRY_POLICY)
        .when(|e: &GatewayError| e.is_retryable())
        .notify(|err, dur: Duration| {
            warn!("Token refresh retrying after error {err}, sleeping {dur:?}");
        })
        .await
        .map_err(|err| match err {
            // Transient residue after the budget is spent reads as an
            // unavailable auth service, not a credential problem.
            e @ (GatewayError::UpstreamStatus { .. } | GatewayError::Reqwest(_))
                if e.is_retryable() =>
            {
                GatewayError::UpstreamUnavailable(e.to_string())
            }
            other => other,
        })
}
