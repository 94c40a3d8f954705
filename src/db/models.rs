use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::auth::credentials::{AuthKind, RefreshCredentials};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub is_banned: bool,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct ApiKey {
    pub id: i64,
    pub user_id: i64,
    pub api_key: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Active,
    Invalid,
    Expired,
}

impl TokenStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenStatus::Active => "active",
            TokenStatus::Invalid => "invalid",
            TokenStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenVisibility {
    Public,
    Private,
}

impl TokenVisibility {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenVisibility::Public => "public",
            TokenVisibility::Private => "private",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct DonatedToken {
    pub id: i64,
    pub owner_user_id: i64,
    pub refresh_token: String,
    pub auth_kind: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub region: String,
    pub profile_arn: Option<String>,
    pub visibility: String,
    pub status: String,
    pub success_count: i64,
    pub fail_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DonatedToken {
    /// Health metric for allocator ranking; no samples counts as healthy.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.fail_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    pub fn credentials(&self) -> RefreshCredentials {
        let auth_kind = if self.auth_kind == "oidc" {
            AuthKind::Oidc
        } else {
            AuthKind::Social
        };
        RefreshCredentials {
            refresh_token: self.refresh_token.clone(),
            auth_kind,
            region: self.region.clone(),
            profile_arn: self.profile_arn.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        }
    }
}
