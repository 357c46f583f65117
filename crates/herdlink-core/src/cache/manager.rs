use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::KeyValueStore;

/// Durable-tier key namespace.
const CACHE_PREFIX: &str = "cache:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub data: Value,
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, data: Value) -> Self {
        Self {
            key: key.into(),
            data,
            cached_at: Utc::now(),
        }
    }

    /// Clock skew (an entry from the future) counts as brand new.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.cached_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        !self.is_fresh(ttl)
    }
}

/// Deterministic key for an endpoint and its (already normalized) query
/// parameters. `BTreeMap` serializes sorted, so parameter order is irrelevant.
pub fn cache_key(endpoint: &str, params: &BTreeMap<String, Value>) -> String {
    let endpoint = endpoint.trim_matches('/');
    if params.is_empty() {
        return endpoint.to_string();
    }
    let params = serde_json::to_string(params).unwrap_or_default();
    format!("{}?{}", endpoint, params)
}

/// `animals` covers `animals`, `animals?{..}` and `animals/7`, not `animals-archive`.
fn belongs_to(key: &str, endpoint: &str) -> bool {
    match key.strip_prefix(endpoint) {
        Some(rest) => rest.is_empty() || rest.starts_with('?') || rest.starts_with('/'),
        None => false,
    }
}

/// Invalidation counters. A read remembers the generation it started in and
/// may only populate the cache if no invalidation happened meanwhile.
#[derive(Debug, Default)]
struct Generations {
    cleared: u64,
    endpoints: HashMap<String, u64>,
}

impl Generations {
    fn current(&self, endpoint: &str) -> u64 {
        self.cleared
            .wrapping_add(self.endpoints.get(endpoint).copied().unwrap_or(0))
    }
}

/// Two-tier response cache: a process-local map in front of the durable
/// key-value store.
///
/// Durable-tier failures are logged and treated as misses; the cache is
/// an optimization and never fails a read.
pub struct CacheManager {
    memory: Mutex<HashMap<String, CacheEntry>>,
    generations: Mutex<Generations>,
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    stale_grace: Duration,
}

impl CacheManager {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration, stale_grace: Duration) -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            generations: Mutex::new(Generations::default()),
            store,
            ttl,
            stale_grace,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn store_key(key: &str) -> String {
        format!("{}{}", CACHE_PREFIX, key)
    }

    /// Memory tier first, then the durable tier (rehydrating memory on a hit).
    pub async fn get_any(&self, key: &str) -> Option<CacheEntry> {
        if let Some(entry) = self.memory.lock().get(key).cloned() {
            return Some(entry);
        }

        let value = match self.store.get(&Self::store_key(key)).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Durable cache read failed");
                return None;
            }
        };
        match serde_json::from_value::<CacheEntry>(value) {
            Ok(entry) => {
                debug!(key, "Rehydrating memory cache from durable tier");
                self.memory.lock().insert(key.to_string(), entry.clone());
                Some(entry)
            }
            Err(e) => {
                debug!(key, error = %e, "Discarding unreadable cache entry");
                None
            }
        }
    }

    /// Entry younger than the TTL.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.get_any(key)
            .await
            .filter(|entry| entry.is_fresh(self.ttl))
    }

    /// Entry within TTL plus the stale grace window; for offline fallback only.
    pub async fn get_stale(&self, key: &str) -> Option<CacheEntry> {
        let limit = self.ttl.saturating_add(self.stale_grace);
        self.get_any(key)
            .await
            .filter(|entry| entry.age() < limit)
    }

    pub async fn set(&self, key: &str, data: Value) {
        self.put(CacheEntry::new(key, data)).await;
    }

    /// Bumped by every `invalidate_endpoint` for `endpoint` and every `clear`.
    pub fn generation(&self, endpoint: &str) -> u64 {
        self.generations.lock().current(endpoint.trim_matches('/'))
    }

    /// Store `data` only if `endpoint` has not been invalidated since
    /// `generation` was read. Returns whether the entry was kept.
    pub async fn set_if_current(
        &self,
        endpoint: &str,
        generation: u64,
        key: &str,
        data: Value,
    ) -> bool {
        let endpoint = endpoint.trim_matches('/');
        let entry = CacheEntry::new(key, data);
        {
            let generations = self.generations.lock();
            if generations.current(endpoint) != generation {
                debug!(key, "Dropping response that predates an invalidation");
                return false;
            }
            self.memory.lock().insert(key.to_string(), entry.clone());
        }
        self.put_durable(&entry).await;

        // An invalidation may have swept the durable tier before our write landed.
        if self.generation(endpoint) != generation {
            if let Err(e) = self.store.remove(&Self::store_key(key)).await {
                warn!(key, error = %e, "Failed to drop superseded cache entry");
            }
            return false;
        }
        true
    }

    async fn put(&self, entry: CacheEntry) {
        self.memory.lock().insert(entry.key.clone(), entry.clone());
        self.put_durable(&entry).await;
    }

    async fn put_durable(&self, entry: &CacheEntry) {
        let key = &entry.key;
        let value = match serde_json::to_value(entry) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize cache entry");
                return;
            }
        };
        if let Err(e) = self.store.set(&Self::store_key(key), value).await {
            warn!(key = %key, error = %e, "Durable cache write failed");
        }
    }

    /// Restart an entry's TTL without changing its data (after a 304).
    pub async fn touch(&self, key: &str) -> Option<CacheEntry> {
        let mut entry = self.get_any(key).await?;
        entry.cached_at = Utc::now();
        self.put(entry.clone()).await;
        Some(entry)
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.memory.lock().remove(key);
        self.store.remove(&Self::store_key(key)).await
    }

    /// Drop every entry belonging to an endpoint, in both tiers.
    pub async fn invalidate_endpoint(&self, endpoint: &str) -> Result<()> {
        let endpoint = endpoint.trim_matches('/');
        {
            let mut generations = self.generations.lock();
            let counter = generations.endpoints.entry(endpoint.to_string()).or_insert(0);
            *counter = counter.wrapping_add(1);
        }
        self.memory.lock().retain(|key, _| !belongs_to(key, endpoint));

        let durable = self.store.keys(&Self::store_key(endpoint)).await?;
        let mut removed = 0;
        for store_key in durable {
            let key = &store_key[CACHE_PREFIX.len()..];
            if belongs_to(key, endpoint) {
                self.store.remove(&store_key).await?;
                removed += 1;
            }
        }
        debug!(endpoint, removed, "Invalidated cached endpoint");
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        {
            let mut generations = self.generations.lock();
            generations.cleared = generations.cleared.wrapping_add(1);
        }
        self.memory.lock().clear();
        for store_key in self.store.keys(CACHE_PREFIX).await? {
            self.store.remove(&store_key).await?;
        }
        debug!("Cache cleared");
        Ok(())
    }

    pub fn memory_len(&self) -> usize {
        self.memory.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn forget_memory(&self) {
        self.memory.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn manager(ttl: Duration) -> (CacheManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let manager = CacheManager::new(store.clone(), ttl, Duration::from_secs(3600));
        (manager, store)
    }

    #[test]
    fn test_cache_key_is_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("page".to_string(), json!(1));
        a.insert("breed".to_string(), json!("angus"));
        let mut b = BTreeMap::new();
        b.insert("breed".to_string(), json!("angus"));
        b.insert("page".to_string(), json!(1));

        assert_eq!(cache_key("/animals/", &a), cache_key("animals", &b));
        assert_eq!(cache_key("animals", &BTreeMap::new()), "animals");
    }

    #[tokio::test]
    async fn test_durable_hit_rehydrates_memory() {
        let (cache, _) = manager(Duration::from_secs(60));
        cache.set("animals", json!([1])).await;
        cache.forget_memory();
        assert_eq!(cache.memory_len(), 0);

        let entry = cache.get("animals").await.unwrap();
        assert_eq!(entry.data, json!([1]));
        assert_eq!(cache.memory_len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_served_only_as_stale() {
        let (cache, _) = manager(Duration::ZERO);
        cache.set("animals", json!([1])).await;

        assert!(cache.get("animals").await.is_none());
        assert_eq!(cache.get_stale("animals").await.unwrap().data, json!([1]));
    }

    #[tokio::test]
    async fn test_invalidate_endpoint_is_prefix_scoped() {
        let (cache, store) = manager(Duration::from_secs(60));
        cache.set("animals", json!(1)).await;
        cache.set("animals?{\"page\":2}", json!(2)).await;
        cache.set("animals/7", json!(3)).await;
        cache.set("animals-archive", json!(4)).await;
        cache.set("fields", json!(5)).await;

        cache.invalidate_endpoint("animals").await.unwrap();

        assert!(cache.get("animals").await.is_none());
        assert!(cache.get("animals/7").await.is_none());
        assert!(cache.get("animals-archive").await.is_some());
        assert_eq!(
            store.keys("cache:").await.unwrap(),
            vec!["cache:animals-archive", "cache:fields"]
        );
    }

    #[tokio::test]
    async fn test_response_older_than_invalidation_is_not_cached() {
        let (cache, store) = manager(Duration::from_secs(60));
        let before = cache.generation("animals");
        let unrelated = cache.generation("fields");

        cache.invalidate_endpoint("/animals/").await.unwrap();
        assert!(!cache.set_if_current("animals", before, "animals/7", json!({"v": 1})).await);
        assert!(cache.get_any("animals/7").await.is_none());
        assert!(store.keys("cache:").await.unwrap().is_empty());

        let now = cache.generation("animals");
        assert!(cache.set_if_current("animals", now, "animals/7", json!({"v": 2})).await);
        assert_eq!(cache.get("animals/7").await.unwrap().data, json!({"v": 2}));

        // other endpoints are untouched until a full clear
        assert_eq!(cache.generation("fields"), unrelated);
        cache.clear().await.unwrap();
        assert!(!cache.set_if_current("fields", unrelated, "fields", json!([])).await);
    }

    #[tokio::test]
    async fn test_clear_twice_is_harmless() {
        let (cache, store) = manager(Duration::from_secs(60));
        cache.set("animals", json!(1)).await;
        store.set("sync:animals", json!({})).await.unwrap();

        cache.clear().await.unwrap();
        cache.clear().await.unwrap();

        assert_eq!(cache.memory_len(), 0);
        assert!(store.keys("cache:").await.unwrap().is_empty());
        assert_eq!(store.keys("sync:").await.unwrap().len(), 1);
    }
}
