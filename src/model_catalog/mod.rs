//! Model name resolution and upstream model metadata.
//!
//! Public model names map to internal CodeWhisperer identifiers through a
//! static table; unknown names fall back to the default model rather than
//! failing the request. A `moka` cache holds upstream metadata
//! (`ListAvailableModels`), refreshed best-effort by a background task —
//! readers never block on a refresh and tolerate stale-or-empty results.

use ahash::AHashMap;
use moka::sync::Cache;
use serde_json::Value;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fallback when an upstream model entry carries no token limits.
pub const DEFAULT_MAX_INPUT_TOKENS: u32 = 200_000;

const MODEL_CACHE_TTL_SECS: u64 = 3600;
const MODEL_CACHE_CAPACITY: u64 = 64;

const DEFAULT_INTERNAL_MODEL: &str = "CLAUDE_SONNET_4_5_20250929_V1_0";

/// Public name -> internal CodeWhisperer model id.
static MODEL_MAPPING: LazyLock<AHashMap<&'static str, &'static str>> = LazyLock::new(|| {
    AHashMap::from_iter([
        ("claude-sonnet-4-5", "CLAUDE_SONNET_4_5_20250929_V1_0"),
        ("claude-sonnet-4-5-20250929", "CLAUDE_SONNET_4_5_20250929_V1_0"),
        ("claude-sonnet-4", "CLAUDE_SONNET_4_20250514_V1_0"),
        ("claude-sonnet-4-20250514", "CLAUDE_SONNET_4_20250514_V1_0"),
        ("claude-3-7-sonnet-20250219", "CLAUDE_3_7_SONNET_20250219_V1_0"),
        ("claude-haiku-4-5", "CLAUDE_HAIKU_4_5_20251001_V1_0"),
        ("claude-haiku-4-5-20251001", "CLAUDE_HAIKU_4_5_20251001_V1_0"),
        ("claude-opus-4-5", "CLAUDE_OPUS_4_5_20251101_V1_0"),
        ("claude-opus-4-5-20251101", "CLAUDE_OPUS_4_5_20251101_V1_0"),
        ("auto", "auto"),
    ])
});

/// Names advertised on `/v1/models`, in display order.
pub static AVAILABLE_MODELS: &[&str] = &[
    "claude-sonnet-4-5",
    "claude-sonnet-4",
    "claude-3-7-sonnet-20250219",
    "claude-haiku-4-5",
    "claude-opus-4-5",
    "auto",
];

/// Resolve a public model name to its internal id; unknown names get the
/// default Sonnet model.
pub fn internal_model_id(public_name: &str) -> &'static str {
    MODEL_MAPPING.get(public_name).copied().unwrap_or_else(|| {
        debug!("Unknown model '{public_name}', using default");
        DEFAULT_INTERNAL_MODEL
    })
}

pub fn is_known_model(public_name: &str) -> bool {
    MODEL_MAPPING.contains_key(public_name)
}

/// Read-mostly metadata cache keyed by upstream `modelId`.
pub struct ModelInfoCache {
    cache: Cache<String, Value>,
    last_update_unix: AtomicI64,
}

impl Default for ModelInfoCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelInfoCache {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder()
                .time_to_live(Duration::from_secs(MODEL_CACHE_TTL_SECS))
                .max_capacity(MODEL_CACHE_CAPACITY)
                .build(),
            last_update_unix: AtomicI64::new(0),
        }
    }

    /// Replace cached entries from a `ListAvailableModels` response body.
    pub fn update(&self, body: &Value) {
        let Some(models) = body.get("models").and_then(Value::as_array) else {
            warn!("ListAvailableModels response carried no models array");
            return;
        };
        for model in models {
            if let Some(id) = model.get("modelId").and_then(Value::as_str) {
                self.cache.insert(id.to_string(), model.clone());
            }
        }
        self.last_update_unix
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
        info!("Updated model cache. Found {} models.", models.len());
    }

    pub fn get(&self, model_id: &str) -> Option<Value> {
        self.cache.get(model_id)
    }

    pub fn max_input_tokens(&self, model_id: &str) -> u32 {
        self.get(model_id)
            .and_then(|m| {
                m.get("tokenLimits")
                    .and_then(|t| t.get("maxInputTokens"))
                    .and_then(Value::as_u64)
            })
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(DEFAULT_MAX_INPUT_TOKENS)
    }

    pub fn size(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn last_update_unix(&self) -> Option<i64> {
        match self.last_update_unix.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub fn is_stale(&self) -> bool {
        match self.last_update_unix() {
            None => true,
            Some(ts) => {
                chrono::Utc::now().timestamp() - ts > i64::try_from(MODEL_CACHE_TTL_SECS).unwrap_or(i64::MAX)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_models_resolve_to_internal_ids() {
        assert_eq!(
            internal_model_id("claude-sonnet-4-5"),
            "CLAUDE_SONNET_4_5_20250929_V1_0"
        );
        assert_eq!(internal_model_id("auto"), "auto");
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        assert_eq!(internal_model_id("gpt-4o"), DEFAULT_INTERNAL_MODEL);
        assert!(!is_known_model("gpt-4o"));
    }

    #[test]
    fn cache_reports_token_limits_with_default() {
        let cache = ModelInfoCache::new();
        assert_eq!(cache.max_input_tokens("missing"), DEFAULT_MAX_INPUT_TOKENS);
        assert!(cache.is_stale());

        cache.update(&json!({
            "models": [
                {"modelId": "m1", "tokenLimits": {"maxInputTokens": 100000}},
                {"modelId": "m2"}
            ]
        }));
        assert_eq!(cache.max_input_tokens("m1"), 100_000);
        assert_eq!(cache.max_input_tokens("m2"), DEFAULT_MAX_INPUT_TOKENS);
        assert!(!cache.is_stale());
        assert_eq!(cache.size(), 2);
    }
}
