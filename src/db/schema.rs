//! SQL DDL for initializing the database schema.
//! SQLite-first design; can be adapted for other RDBMS.

/// SQLite schema includes:
/// - `users` table (gateway accounts; ban flag gates API access)
/// - `api_keys` table (`sk-` keys, one row per issued key)
/// - `donated_tokens` table (refresh tokens contributed per user, with the
///   public/private pool flag and health counters)
pub const SQLITE_INIT: &str = r#"
-- ---------------------------------------------------------------------------
-- Gateway users
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY NOT NULL,
    username TEXT NOT NULL,
    is_banned INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL, -- RFC3339
    last_login_at TEXT NULL -- RFC3339
);

-- ---------------------------------------------------------------------------
-- User API keys (sk-...)
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS api_keys (
    id INTEGER PRIMARY KEY NOT NULL,
    user_id INTEGER NOT NULL REFERENCES users(id),
    api_key TEXT NOT NULL,
    name TEXT NULL,
    created_at TEXT NOT NULL, -- RFC3339
    last_used_at TEXT NULL, -- RFC3339
    UNIQUE(api_key)
);

CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys(user_id);

-- ---------------------------------------------------------------------------
-- Donated refresh tokens (one upstream account per row)
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS donated_tokens (
    id INTEGER PRIMARY KEY NOT NULL,
    owner_user_id INTEGER NOT NULL REFERENCES users(id),
    refresh_token TEXT NOT NULL,
    auth_kind TEXT NOT NULL DEFAULT 'social', -- 'social' | 'oidc'
    client_id TEXT NULL,
    client_secret TEXT NULL,
    region TEXT NOT NULL DEFAULT 'us-east-1',
    profile_arn TEXT NULL,
    visibility TEXT NOT NULL DEFAULT 'private', -- 'public' | 'private'
    status TEXT NOT NULL DEFAULT 'active', -- 'active' | 'invalid' | 'expired'
    success_count INTEGER NOT NULL DEFAULT 0,
    fail_count INTEGER NOT NULL DEFAULT 0,
    last_used_at TEXT NULL, -- RFC3339
    created_at TEXT NOT NULL -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_donated_tokens_owner ON donated_tokens(owner_user_id, status);
CREATE INDEX IF NOT EXISTS idx_donated_tokens_public ON donated_tokens(visibility, status);
"#;
