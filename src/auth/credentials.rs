//! Credential state and the persisted credentials file.
//!
//! The file format mirrors what the Kiro desktop app writes:
//! `refreshToken`, `accessToken?`, `profileArn?`, `region?`, `expiresAt?`
//! (ISO-8601), `clientId?`, `clientSecret?`. Unknown keys are preserved on
//! rewrite so the gateway can share the file with other tooling.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::GatewayError;

/// The two refresh-token dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Social,
    Oidc,
}

/// Persistent identity of one upstream account.
#[derive(Debug, Clone)]
pub struct RefreshCredentials {
    pub refresh_token: String,
    pub auth_kind: AuthKind,
    pub region: String,
    pub profile_arn: Option<String>,
    /// Required when `auth_kind == Oidc`.
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl RefreshCredentials {
    pub fn social(refresh_token: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            refresh_token: refresh_token.into(),
            auth_kind: AuthKind::Social,
            region: region.into(),
            profile_arn: None,
            client_id: None,
            client_secret: None,
        }
    }

    pub fn with_profile_arn(mut self, profile_arn: Option<String>) -> Self {
        self.profile_arn = profile_arn.filter(|p| !p.is_empty());
        self
    }
}

/// Derived, volatile access credential. `expires_at` already carries the
/// 60-second safety skew applied at refresh time.
#[derive(Debug, Clone)]
pub struct AccessCredentials {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessCredentials {
    /// True when less than `threshold_secs` of validity remains.
    pub fn is_expiring(&self, threshold_secs: u64) -> bool {
        let threshold = Duration::seconds(i64::try_from(threshold_secs).unwrap_or(i64::MAX));
        Utc::now() + threshold >= self.expires_at
    }
}

/// On-disk credentials as loaded from `creds_file`.
#[derive(Debug, Default, Clone)]
pub struct StoredCredentials {
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    pub profile_arn: Option<String>,
    pub region: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

pub fn load_credentials_file(path: &Path) -> Option<StoredCredentials> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Credentials file not readable: {}: {e}", path.display());
            return None;
        }
    };
    let data: Value = match serde_json::from_str(&raw) {
        Ok(data) => data,
        Err(e) => {
            warn!("Credentials file is not valid JSON: {}: {e}", path.display());
            return None;
        }
    };
    Some(stored_from_value(&data))
}

/// Fetch credentials from an HTTP(S) location. Remote credentials are
/// load-only; rotations are not written back.
pub async fn fetch_credentials_url(
    client: &reqwest::Client,
    url: &str,
) -> Result<StoredCredentials, GatewayError> {
    let data: Value = client.get(url).send().await?.error_for_status()?.json().await?;
    Ok(stored_from_value(&data))
}

fn stored_from_value(data: &Value) -> StoredCredentials {
    let str_field = |key: &str| {
        data.get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.is_empty())
    };

    let expires_at = str_field("expiresAt").and_then(|s| parse_expires_at(&s));

    StoredCredentials {
        refresh_token: str_field("refreshToken"),
        access_token: str_field("accessToken"),
        profile_arn: str_field("profileArn"),
        region: str_field("region"),
        expires_at,
        client_id: str_field("clientId"),
        client_secret: str_field("clientSecret"),
    }
}

/// Overlay the refreshed fields onto the existing file contents and write
/// atomically. Other keys in the file are left untouched.
pub fn save_credentials_file(
    path: &Path,
    access_token: &str,
    refresh_token: &str,
    expires_at: DateTime<Utc>,
    profile_arn: Option<&str>,
) -> Result<(), GatewayError> {
    let mut existing: Map<String, Value> = match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<Value>(&raw)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default(),
        Err(_) => Map::new(),
    };

    existing.insert("accessToken".to_string(), Value::String(access_token.to_string()));
    existing.insert("refreshToken".to_string(), Value::String(refresh_token.to_string()));
    existing.insert("expiresAt".to_string(), Value::String(expires_at.to_rfc3339()));
    if let Some(arn) = profile_arn {
        existing.insert("profileArn".to_string(), Value::String(arn.to_string()));
    }

    let serialized = serde_json::to_string_pretty(&Value::Object(existing))?;

    // Write-then-rename so a crash mid-write leaves the previous file intact.
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serialized)?;
    std::fs::rename(&tmp, path)?;

    debug!("Credentials saved to {}", path.display());
    Ok(())
}

fn parse_expires_at(raw: &str) -> Option<DateTime<Utc>> {
    let normalized = raw.strip_suffix('Z').map(|s| format!("{s}+00:00"));
    let candidate = normalized.as_deref().unwrap_or(raw);
    DateTime::parse_from_rfc3339(candidate)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            warn!("Failed to parse expiresAt: {raw}");
            None
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_file(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("kirogate-creds-{}-{name}.json", std::process::id()));
        p
    }

    #[test]
    fn save_preserves_unknown_keys() {
        let path = temp_file("preserve");
        std::fs::write(
            &path,
            serde_json::to_string(&json!({
                "refreshToken": "old",
                "customField": "keep-me"
            }))
            .unwrap(),
        )
        .unwrap();

        save_credentials_file(&path, "A1", "R1", Utc::now(), Some("arn:x")).unwrap();

        let data: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(data["customField"], "keep-me");
        assert_eq!(data["accessToken"], "A1");
        assert_eq!(data["refreshToken"], "R1");
        assert_eq!(data["profileArn"], "arn:x");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_parses_z_suffixed_expiry() {
        let path = temp_file("zexpiry");
        std::fs::write(
            &path,
            serde_json::to_string(&json!({
                "refreshToken": "r",
                "accessToken": "a",
                "expiresAt": "2026-01-01T00:00:00Z"
            }))
            .unwrap(),
        )
        .unwrap();

        let stored = load_credentials_file(&path).unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some("r"));
        assert!(stored.expires_at.is_some());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn expiring_window_honors_threshold() {
        let fresh = AccessCredentials {
            access_token: "t".to_string(),
            expires_at: Utc::now() + Duration::seconds(600),
        };
        assert!(!fresh.is_expiring(300));
        assert!(fresh.is_expiring(900));
    }
}
