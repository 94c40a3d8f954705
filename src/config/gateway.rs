//! Upstream (Kiro/CodeWhisperer) settings: region, credentials, retry and
//! timeout policy, translation limits.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Default upstream AWS region.
    /// TOML: `gateway.region`. Default: `us-east-1`.
    #[serde(default = "default_region")]
    pub region: String,

    /// Default refresh token (single-tenant mode). Empty disables the
    /// built-in credential manager; multi-tenant keys still work.
    #[serde(default)]
    pub refresh_token: String,

    /// Default CodeWhisperer profile ARN.
    #[serde(default)]
    pub profile_arn: String,

    /// Path to a JSON credentials file kept in sync after refreshes.
    /// Empty disables persistence.
    #[serde(default)]
    pub creds_file: String,

    /// Seconds before `expires_at` at which a token is treated as expiring.
    #[serde(default = "default_token_refresh_threshold")]
    pub token_refresh_threshold: u64,

    /// Non-streaming retry attempts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay (seconds) for exponential backoff between attempts.
    #[serde(default = "default_base_retry_delay")]
    pub base_retry_delay: f64,

    /// Per-attempt timeout (seconds) waiting for streaming headers/first token.
    #[serde(default = "default_first_token_timeout")]
    pub first_token_timeout: u64,

    /// Streaming retry attempts.
    #[serde(default = "default_first_token_max_retries")]
    pub first_token_max_retries: u32,

    /// Per-attempt timeout (seconds) for non-streaming requests.
    #[serde(default = "default_non_stream_timeout")]
    pub non_stream_timeout: u64,

    /// Tool descriptions longer than this are hoisted into the system prompt.
    /// 0 disables hoisting.
    #[serde(default = "default_tool_description_max_length")]
    pub tool_description_max_length: usize,

    /// Model-name substrings that select the slow-model timeout multiplier.
    #[serde(default = "default_slow_model_patterns")]
    pub slow_model_patterns: Vec<String>,

    /// Timeout multiplier applied to slow models.
    #[serde(default = "default_slow_model_multiplier")]
    pub slow_model_multiplier: f64,

    /// Bound on cached per-tenant credential managers.
    #[serde(default = "default_auth_cache_size")]
    pub auth_cache_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            refresh_token: String::new(),
            profile_arn: String::new(),
            creds_file: String::new(),
            token_refresh_threshold: default_token_refresh_threshold(),
            max_retries: default_max_retries(),
            base_retry_delay: default_base_retry_delay(),
            first_token_timeout: default_first_token_timeout(),
            first_token_max_retries: default_first_token_max_retries(),
            non_stream_timeout: default_non_stream_timeout(),
            tool_description_max_length: default_tool_description_max_length(),
            slow_model_patterns: default_slow_model_patterns(),
            slow_model_multiplier: default_slow_model_multiplier(),
            auth_cache_size: default_auth_cache_size(),
        }
    }
}

impl GatewayConfig {
    /// Timeout multiplier for the given public model name.
    pub fn timeout_multiplier(&self, model: &str) -> f64 {
        let lowered = model.to_ascii_lowercase();
        if self
            .slow_model_patterns
            .iter()
            .any(|p| !p.is_empty() && lowered.contains(&p.to_ascii_lowercase()))
        {
            self.slow_model_multiplier
        } else {
            1.0
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_token_refresh_threshold() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_retry_delay() -> f64 {
    1.0
}

fn default_first_token_timeout() -> u64 {
    60
}

fn default_first_token_max_retries() -> u32 {
    3
}

fn default_non_stream_timeout() -> u64 {
    600
}

fn default_tool_description_max_length() -> usize {
    2000
}

fn default_slow_model_patterns() -> Vec<String> {
    vec!["opus".to_string()]
}

fn default_slow_model_multiplier() -> f64 {
    2.0
}

fn default_auth_cache_size() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_model_multiplier_matches_substring_case_insensitively() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.timeout_multiplier("claude-opus-4-5"), 2.0);
        assert_eq!(cfg.timeout_multiplier("Claude-OPUS-4"), 2.0);
        assert_eq!(cfg.timeout_multiplier("claude-sonnet-4-5"), 1.0);
    }

    #[test]
    fn empty_pattern_never_matches() {
        let cfg = GatewayConfig {
            slow_model_patterns: vec![String::new()],
            ..Default::default()
        };
        assert_eq!(cfg.timeout_multiplier("anything"), 1.0);
    }
}
