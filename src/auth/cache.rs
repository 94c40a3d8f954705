//! Bounded cache of per-tenant credential managers.
//!
//! Maps refresh token -> `CredentialManager` with insertion-order LRU
//! eviction so multi-tenant traffic cannot grow unbounded state. Concurrent
//! misses for the same key may construct two managers; the second insert
//! wins and the loser refreshes independently, which yields an equivalent
//! token.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::auth::credentials::RefreshCredentials;
use crate::auth::manager::CredentialManager;
use crate::auth::refresh::RefreshEndpoints;
use crate::utils::logging::mask_token;

/// Bookkeeping core: no IO, no locks.
#[derive(Default)]
struct LruState {
    map: HashMap<String, Arc<CredentialManager>>,
    order: VecDeque<String>,
}

impl LruState {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.map.len() > capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.map.remove(&oldest);
            debug!("Evicted credential manager for token {}", mask_token(&oldest));
        }
    }
}

type EndpointsFactory = Box<dyn Fn(&str) -> RefreshEndpoints + Send + Sync>;

pub struct AuthCache {
    capacity: usize,
    refresh_threshold_secs: u64,
    http: reqwest::Client,
    endpoints_for: EndpointsFactory,
    inner: Mutex<LruState>,
}

impl AuthCache {
    pub fn new(capacity: usize, refresh_threshold_secs: u64, http: reqwest::Client) -> Self {
        Self::with_endpoints_factory(
            capacity,
            refresh_threshold_secs,
            http,
            Box::new(RefreshEndpoints::for_region),
        )
    }

    /// Construct with a custom endpoint factory, so tests can point new
    /// managers at a mock auth server.
    pub fn with_endpoints_factory(
        capacity: usize,
        refresh_threshold_secs: u64,
        http: reqwest::Client,
        endpoints_for: EndpointsFactory,
    ) -> Self {
        Self {
            capacity: capacity.max(1),
            refresh_threshold_secs,
            http,
            endpoints_for,
            inner: Mutex::new(LruState::default()),
        }
    }

    /// Return the cached manager for this refresh token, constructing and
    /// inserting one on miss. Hits are promoted to most-recently-used.
    pub async fn get_or_create(&self, creds: RefreshCredentials) -> Arc<CredentialManager> {
        let key = creds.refresh_token.clone();
        let mut inner = self.inner.lock().await;

        if let Some(manager) = inner.map.get(&key).cloned() {
            inner.touch(&key);
            return manager;
        }

        debug!(
            "Creating credential manager for token {}",
            mask_token(&key)
        );
        let endpoints = (self.endpoints_for)(&creds.region);
        let manager = Arc::new(CredentialManager::new(
            creds,
            self.http.clone(),
            endpoints,
            self.refresh_threshold_secs,
        ));
        inner.map.insert(key.clone(), manager.clone());
        inner.touch(&key);
        inner.evict_to(self.capacity);
        manager
    }

    pub async fn remove(&self, refresh_token: &str) {
        let mut inner = self.inner.lock().await;
        inner.map.remove(refresh_token);
        if let Some(pos) = inner.order.iter().position(|k| k == refresh_token) {
            inner.order.remove(pos);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.map.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> AuthCache {
        AuthCache::new(capacity, 300, reqwest::Client::new())
    }

    fn creds(token: &str) -> RefreshCredentials {
        RefreshCredentials::social(token, "us-east-1")
    }

    #[tokio::test]
    async fn hit_returns_the_same_manager() {
        let cache = cache(10);
        let a = cache.get_or_create(creds("tok-1")).await;
        let b = cache.get_or_create(creds("tok-1")).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn least_recently_used_entry_is_evicted_at_capacity() {
        let cache = cache(2);
        let first = cache.get_or_create(creds("tok-1")).await;
        cache.get_or_create(creds("tok-2")).await;

        // Touch tok-1 so tok-2 becomes LRU.
        cache.get_or_create(creds("tok-1")).await;
        cache.get_or_create(creds("tok-3")).await;

        assert_eq!(cache.len().await, 2);
        let again = cache.get_or_create(creds("tok-1")).await;
        assert!(Arc::ptr_eq(&first, &again));

        // tok-2 was evicted: re-creating it yields a fresh manager and
        // evicts the current LRU (tok-3).
        cache.get_or_create(creds("tok-2")).await;
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn remove_and_clear_shrink_the_cache() {
        let cache = cache(10);
        cache.get_or_create(creds("tok-1")).await;
        cache.get_or_create(creds("tok-2")).await;

        cache.remove("tok-1").await;
        assert_eq!(cache.len().await, 1);

        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}
