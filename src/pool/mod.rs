//! Donated-token allocation for user-API-key traffic.
//!
//! A user's own active tokens are preferred; the public pool is the
//! fallback. Among candidates, the healthiest (highest success rate) wins,
//! and equally healthy tokens rotate by least-recent use.

use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::{AuthCache, CredentialManager};
use crate::db::models::{DonatedToken, TokenStatus};
use crate::db::store::TokenStore;
use crate::error::GatewayError;

pub struct TokenAllocator {
    store: Arc<dyn TokenStore>,
    auth_cache: Arc<AuthCache>,
}

impl TokenAllocator {
    pub fn new(store: Arc<dyn TokenStore>, auth_cache: Arc<AuthCache>) -> Self {
        Self { store, auth_cache }
    }

    /// Pick the best token for this user and hand back its credential
    /// manager.
    pub async fn best_token_for(
        &self,
        user_id: i64,
    ) -> Result<(DonatedToken, Arc<CredentialManager>), GatewayError> {
        let mut candidates = self.store.get_user_active_donated_tokens(user_id).await?;
        if candidates.is_empty() {
            candidates = self.store.get_public_active_donated_tokens().await?;
        }
        if candidates.is_empty() {
            return Err(GatewayError::NoTokenAvailable);
        }

        candidates.sort_by(rank);
        let chosen = candidates.remove(0);
        info!(
            token_id = chosen.id,
            success_rate = chosen.success_rate(),
            "Allocated donated token for user {user_id}"
        );

        let manager = self.auth_cache.get_or_create(chosen.credentials()).await;
        Ok((chosen, manager))
    }

    /// Success/failure accounting once the request finishes.
    pub async fn report(&self, token_id: i64, success: bool) {
        if let Err(e) = self.store.record_token_usage(token_id, success).await {
            warn!("Failed to record usage for token {token_id}: {e}");
        }
    }

    /// Demote a token whose refresh terminally failed. Best-effort.
    pub async fn handle_auth_failure(&self, token_id: i64, error: &GatewayError) {
        let GatewayError::AuthRejected { status, body } = error else {
            return;
        };

        let lowered = body.to_ascii_lowercase();
        let status_value =
            if lowered.contains("expired") || lowered.contains("invalid_grant") {
                TokenStatus::Expired
            } else {
                TokenStatus::Invalid
            };

        warn!(
            token_id,
            %status,
            "Refresh rejected, marking token {}",
            status_value.as_str()
        );
        if let Err(e) = self.store.set_token_status(token_id, status_value).await {
            warn!("Failed to update status for token {token_id}: {e}");
        }
    }
}

/// Success rate descending, then last-used ascending (never-used first).
fn rank(a: &DonatedToken, b: &DonatedToken) -> Ordering {
    b.success_rate()
        .partial_cmp(&a.success_rate())
        .unwrap_or(Ordering::Equal)
        .then_with(|| match (a.last_used_at, b.last_used_at) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(&b),
        })
}
