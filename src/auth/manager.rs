//! Per-account credential manager.
//!
//! One manager exists per distinct refresh token. The mutex expresses the
//! core invariant: at most one refresh call in flight per account. Holders
//! perform the refresh network call and the credentials-file write while
//! holding it; a reader racing a refresh waits and then observes the new
//! token.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::auth::credentials::{
    AccessCredentials, RefreshCredentials, load_credentials_file, save_credentials_file,
};
use crate::auth::refresh::{RefreshEndpoints, refresh_with_retry};
use crate::error::GatewayError;

#[derive(Debug)]
struct TokenState {
    refresh: RefreshCredentials,
    access: Option<AccessCredentials>,
}

#[derive(Debug)]
pub struct CredentialManager {
    http: reqwest::Client,
    endpoints: RefreshEndpoints,
    creds_file: Option<PathBuf>,
    refresh_threshold_secs: u64,
    state: Mutex<TokenState>,
}

impl CredentialManager {
    pub fn new(
        refresh: RefreshCredentials,
        http: reqwest::Client,
        endpoints: RefreshEndpoints,
        refresh_threshold_secs: u64,
    ) -> Self {
        Self {
            http,
            endpoints,
            creds_file: None,
            refresh_threshold_secs,
            state: Mutex::new(TokenState {
                refresh,
                access: None,
            }),
        }
    }

    /// Attach a credentials file. Existing file contents override the seed
    /// credentials (the file is the durable source of truth after rotations).
    pub fn with_creds_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(stored) = load_credentials_file(&path) {
            let state = self.state.get_mut();
            if let Some(token) = stored.refresh_token {
                state.refresh.refresh_token = token;
            }
            if let Some(region) = stored.region {
                state.refresh.region = region;
            }
            if let Some(arn) = stored.profile_arn {
                state.refresh.profile_arn = Some(arn);
            }
            if let Some(client_id) = stored.client_id {
                state.refresh.client_id = Some(client_id);
            }
            if let Some(client_secret) = stored.client_secret {
                state.refresh.client_secret = Some(client_secret);
            }
            if let (Some(access_token), Some(expires_at)) =
                (stored.access_token, stored.expires_at)
            {
                state.access = Some(AccessCredentials {
                    access_token,
                    expires_at,
                });
            }
            info!("Credentials loaded from {}", path.display());
        }
        self.creds_file = Some(path);
        self
    }

    /// Returns a token with more than `refresh_threshold_secs` of validity
    /// left, refreshing first when needed.
    pub async fn get_access_token(&self) -> Result<String, GatewayError> {
        let mut state = self.state.lock().await;

        let needs_refresh = match &state.access {
            Some(access) => access.is_expiring(self.refresh_threshold_secs),
            None => true,
        };
        if needs_refresh {
            self.refresh_locked(&mut state).await?;
        }

        state
            .access
            .as_ref()
            .map(|a| a.access_token.clone())
            .ok_or_else(|| GatewayError::ProtocolViolation("refresh yielded no access token".into()))
    }

    /// Unconditional refresh; used after an upstream 403.
    pub async fn force_refresh(&self) -> Result<String, GatewayError> {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await?;
        state
            .access
            .as_ref()
            .map(|a| a.access_token.clone())
            .ok_or_else(|| GatewayError::ProtocolViolation("refresh yielded no access token".into()))
    }

    async fn refresh_locked(&self, state: &mut TokenState) -> Result<(), GatewayError> {
        if state.refresh.refresh_token.is_empty() {
            return Err(GatewayError::CredentialMissing);
        }

        info!("Refreshing Kiro access token...");
        let refreshed = refresh_with_retry(&self.http, &self.endpoints, &state.refresh).await?;

        let rotated_refresh = refreshed
            .refresh_token
            .clone()
            .unwrap_or_else(|| state.refresh.refresh_token.clone());
        let profile_arn = refreshed
            .profile_arn
            .clone()
            .or_else(|| state.refresh.profile_arn.clone());

        // Durable store first, memory second: a crash mid-write leaves
        // readable stale state rather than a missing one. Persist failures
        // are logged and the in-memory update still happens.
        if let Some(path) = &self.creds_file {
            if let Err(e) = save_credentials_file(
                path,
                &refreshed.access_token,
                &rotated_refresh,
                refreshed.expires_at,
                profile_arn.as_deref(),
            ) {
                warn!("Error saving credentials to {}: {e}", path.display());
            }
        }

        state.refresh.refresh_token = rotated_refresh;
        state.refresh.profile_arn = profile_arn;
        state.access = Some(AccessCredentials {
            access_token: refreshed.access_token,
            expires_at: refreshed.expires_at,
        });

        info!(
            "Token refreshed, expires: {}",
            state
                .access
                .as_ref()
                .map(|a| a.expires_at.to_rfc3339())
                .unwrap_or_default()
        );
        Ok(())
    }

    pub async fn profile_arn(&self) -> Option<String> {
        self.state.lock().await.refresh.profile_arn.clone()
    }

    pub async fn region(&self) -> String {
        self.state.lock().await.refresh.region.clone()
    }

    /// Current expiry, if an access token is held. Admin/health observability.
    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.access.as_ref().map(|a| a.expires_at)
    }

    /// True when a valid, non-expiring token is currently held.
    pub async fn has_fresh_token(&self) -> bool {
        self.state
            .lock()
            .await
            .access
            .as_ref()
            .is_some_and(|a| !a.is_expiring(self.refresh_threshold_secs))
    }

    #[cfg(test)]
    pub(crate) fn with_seeded_access(self, access_token: &str, expires_at: DateTime<Utc>) -> Self {
        {
            let mut state = self.state.try_lock().expect("fresh manager is uncontended");
            state.access = Some(AccessCredentials {
                access_token: access_token.to_string(),
                expires_at,
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn manager_with_token(refresh_token: &str) -> CredentialManager {
        CredentialManager::new(
            RefreshCredentials::social(refresh_token, "us-east-1"),
            reqwest::Client::new(),
            RefreshEndpoints::for_region("us-east-1"),
            300,
        )
    }

    #[tokio::test]
    async fn missing_refresh_token_fails_without_network() {
        let manager = manager_with_token("");
        let err = manager.get_access_token().await.unwrap_err();
        assert!(matches!(err, GatewayError::CredentialMissing));
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let manager = manager_with_token("refresh-1")
            .with_seeded_access("access-1", Utc::now() + Duration::hours(1));
        let token = manager.get_access_token().await.unwrap();
        assert_eq!(token, "access-1");
    }

    #[tokio::test]
    async fn expiring_token_is_not_returned() {
        // Token expires inside the threshold window; the manager must try to
        // refresh (and fail here: empty refresh token).
        let manager = manager_with_token("")
            .with_seeded_access("stale", Utc::now() + Duration::seconds(10));
        let err = manager.get_access_token().await.unwrap_err();
        assert!(matches!(err, GatewayError::CredentialMissing));
    }
}
