//! The persistence interface the request path depends on.
//!
//! Handlers and the token allocator call through `TokenStore`; the SQLite
//! implementation below is the production one, and tests may substitute an
//! in-memory double.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::{str::FromStr, time::Duration};
use tracing::info;

use crate::db::models::{ApiKey, DonatedToken, TokenStatus, User};
use crate::db::schema::SQLITE_INIT;
use crate::error::GatewayError;

/// Connect to SQLite and initialize the schema.
pub async fn connect(database_url: &str) -> Result<SqlitePool, GatewayError> {
    let connect_opts = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5))
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new().connect_with(connect_opts).await?;

    for statement in SQLITE_INIT.split(';') {
        let statement = statement.trim();
        if !statement.is_empty() {
            sqlx::query(statement).execute(&pool).await?;
        }
    }

    info!("Database initialized");
    Ok(pool)
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Resolve an `sk-...` key to its owner; `None` when unknown.
    async fn verify_user_api_key(
        &self,
        key: &str,
    ) -> Result<Option<(i64, ApiKey)>, GatewayError>;

    async fn get_user(&self, user_id: i64) -> Result<Option<User>, GatewayError>;

    async fn get_user_active_donated_tokens(
        &self,
        user_id: i64,
    ) -> Result<Vec<DonatedToken>, GatewayError>;

    async fn get_public_active_donated_tokens(&self) -> Result<Vec<DonatedToken>, GatewayError>;

    async fn get_token_credentials(
        &self,
        token_id: i64,
    ) -> Result<Option<DonatedToken>, GatewayError>;

    /// Success/failure accounting after a request completes.
    async fn record_token_usage(&self, token_id: i64, success: bool) -> Result<(), GatewayError>;

    async fn set_token_status(
        &self,
        token_id: i64,
        status: TokenStatus,
    ) -> Result<(), GatewayError>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TokenStore for SqliteStore {
    async fn verify_user_api_key(
        &self,
        key: &str,
    ) -> Result<Option<(i64, ApiKey)>, GatewayError> {
        let row = sqlx::query_as::<_, ApiKey>(
            "SELECT id, user_id, api_key, name, created_at, last_used_at \
             FROM api_keys WHERE api_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(api_key) = row else {
            return Ok(None);
        };

        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(api_key.id)
            .execute(&self.pool)
            .await?;

        Ok(Some((api_key.user_id, api_key)))
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>, GatewayError> {
        let row = sqlx::query_as::<_, User>(
            "SELECT id, username, is_banned, created_at, last_login_at FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_user_active_donated_tokens(
        &self,
        user_id: i64,
    ) -> Result<Vec<DonatedToken>, GatewayError> {
        let rows = sqlx::query_as::<_, DonatedToken>(
            "SELECT * FROM donated_tokens WHERE owner_user_id = ? AND status = 'active'",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_public_active_donated_tokens(&self) -> Result<Vec<DonatedToken>, GatewayError> {
        let rows = sqlx::query_as::<_, DonatedToken>(
            "SELECT * FROM donated_tokens WHERE visibility = 'public' AND status = 'active'",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_token_credentials(
        &self,
        token_id: i64,
    ) -> Result<Option<DonatedToken>, GatewayError> {
        let row = sqlx::query_as::<_, DonatedToken>("SELECT * FROM donated_tokens WHERE id = ?")
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn record_token_usage(&self, token_id: i64, success: bool) -> Result<(), GatewayError> {
        let column = if success {
            "success_count"
        } else {
            "fail_count"
        };
        let sql = format!(
            "UPDATE donated_tokens SET {column} = {column} + 1, last_used_at = ? WHERE id = ?"
        );
        sqlx::query(&sql)
            .bind(Utc::now())
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_token_status(
        &self,
        token_id: i64,
        status: TokenStatus,
    ) -> Result<(), GatewayError> {
        sqlx::query("UPDATE donated_tokens SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
