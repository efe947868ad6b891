//! Tier-1 key-value cache
//!
//! Clean cuboids live in an LRU with a TTL. Dirty write entries are kept apart and are
//! never evicted; they disappear only when the flush engine removes them. The cache also
//! carries small state records (ordered sets, counters) and the per-key advisory locks.

use crate::config::CacheConfig;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;

/// Tier-1 cache interface
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Values in key order
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    /// Store a clean, evictable entry
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;

    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Drop every clean entry whose key starts with `prefix`
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Store a dirty entry that survives eviction until removed
    async fn put_dirty(&self, key: &str, value: Bytes) -> Result<()>;

    async fn get_dirty(&self, key: &str) -> Result<Option<Bytes>>;

    async fn remove_dirty(&self, key: &str) -> Result<()>;

    /// Add to an ordered set; true if the member was new
    async fn set_add(&self, set: &str, member: &str) -> Result<bool>;

    async fn set_remove(&self, set: &str, member: &str) -> Result<bool>;

    async fn set_members(&self, set: &str) -> Result<Vec<String>>;

    /// Add `by` to a counter, returning the new value
    async fn incr(&self, key: &str, by: i64) -> Result<i64>;

    async fn reset_counter(&self, key: &str) -> Result<()>;

    /// Exclusive advisory lock on `key`, released when the guard drops
    async fn advisory_lock(&self, key: &str) -> Result<AdvisoryLock>;
}

type LockMap = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Per-key async mutexes, created on demand and removed when uncontended
#[derive(Default, Clone)]
pub struct LockTable {
    locks: LockMap,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> AdvisoryLock {
        let mutex = {
            let mut locks = self.locks.lock();
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        AdvisoryLock {
            key: key.to_string(),
            locks: self.locks.clone(),
            _guard: guard,
        }
    }

    /// Keys with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scoped advisory lock on one cuboid key
pub struct AdvisoryLock {
    key: String,
    locks: LockMap,
    _guard: OwnedMutexGuard<()>,
}

impl AdvisoryLock {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // table + this guard; anyone else waiting holds another reference
        if let Some(mutex) = locks.get(&self.key) {
            if Arc::strong_count(mutex) <= 2 {
                locks.remove(&self.key);
            }
        }
    }
}

impl std::fmt::Debug for AdvisoryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisoryLock").field("key", &self.key).finish()
    }
}

struct CacheEntry {
    value: Bytes,
    inserted_at: Instant,
}

/// In-process tier-1 cache
pub struct MemoryCache {
    clean: Mutex<LruCache<String, CacheEntry>>,
    dirty: Mutex<HashMap<String, Bytes>>,
    sets: Mutex<HashMap<String, BTreeSet<String>>>,
    counters: Mutex<HashMap<String, i64>>,
    locks: LockTable,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            clean: Mutex::new(LruCache::new(capacity)),
            dirty: Mutex::new(HashMap::new()),
            sets: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            locks: LockTable::new(),
            ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, Duration::from_secs(config.ttl_secs))
    }

    /// Clean entries currently held
    pub fn len(&self) -> usize {
        self.clean.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.lock().len()
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.locks
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("len", &self.len())
            .field("dirty", &self.dirty_len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut clean = self.clean.lock();
        if let Some(entry) = clean.get(key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Ok(Some(entry.value.clone()));
            }
            clean.pop(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.clean.lock().put(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut clean = self.clean.lock();
        for key in keys {
            clean.pop(key);
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut clean = self.clean.lock();
        let doomed: Vec<String> = clean
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            clean.pop(key);
        }
        Ok(doomed.len())
    }

    async fn put_dirty(&self, key: &str, value: Bytes) -> Result<()> {
        self.dirty.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get_dirty(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.dirty.lock().get(key).cloned())
    }

    async fn remove_dirty(&self, key: &str) -> Result<()> {
        self.dirty.lock().remove(key);
        Ok(())
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<bool> {
        Ok(self
            .sets
            .lock()
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<bool> {
        let mut sets = self.sets.lock();
        let removed = match sets.get_mut(set) {
            Some(members) => members.remove(member),
            None => false,
        };
        if sets.get(set).is_some_and(|m| m.is_empty()) {
            sets.remove(set);
        }
        Ok(removed)
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>> {
        Ok(self
            .sets
            .lock()
            .get(set)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        let mut counters = self.counters.lock();
        let value = counters.entry(key.to_string()).or_insert(0);
        *value += by;
        Ok(*value)
    }

    async fn reset_counter(&self, key: &str) -> Result<()> {
        self.counters.lock().remove(key);
        Ok(())
    }

    async fn advisory_lock(&self, key: &str) -> Result<AdvisoryLock> {
        Ok(self.locks.lock(key).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_cache_basic_operations() {
        let cache = MemoryCache::new(10, Duration::from_secs(60));
        assert!(cache.get("a").await.unwrap().is_none());

        cache.put("a", Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap().unwrap(), Bytes::from_static(b"1"));

        cache.delete(&["a".to_string()]).await.unwrap();
        assert!(cache.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction_spares_dirty() {
        let cache = MemoryCache::new(2, Duration::from_secs(60));
        cache.put_dirty("w", Bytes::from_static(b"dirty")).await.unwrap();
        for key in ["a", "b", "c"] {
            cache.put(key, Bytes::from_static(b"x")).await.unwrap();
        }
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.get("c").await.unwrap().is_some());
        assert_eq!(cache.len(), 2);
        assert!(cache.get_dirty("w").await.unwrap().is_some());

        cache.remove_dirty("w").await.unwrap();
        assert_eq!(cache.dirty_len(), 0);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = MemoryCache::new(10, Duration::from_millis(20));
        cache.put("a", Bytes::from_static(b"1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let cache = MemoryCache::default();
        cache.put("CACHED-CUBOID&1&1&1&0&0&0&0", Bytes::new()).await.unwrap();
        cache.put("CACHED-CUBOID&1&1&2&0&0&0&0", Bytes::new()).await.unwrap();
        let removed = cache.delete_prefix("CACHED-CUBOID&1&1&1&").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_sets_and_counters() {
        let cache = MemoryCache::default();
        assert!(cache.set_add("dirty", "b").await.unwrap());
        assert!(cache.set_add("dirty", "a").await.unwrap());
        assert!(!cache.set_add("dirty", "a").await.unwrap());
        assert_eq!(cache.set_members("dirty").await.unwrap(), vec!["a", "b"]);
        assert!(cache.set_remove("dirty", "a").await.unwrap());
        assert!(!cache.set_remove("missing", "a").await.unwrap());

        assert_eq!(cache.incr("poison", 1).await.unwrap(), 1);
        assert_eq!(cache.incr("poison", 2).await.unwrap(), 3);
        cache.reset_counter("poison").await.unwrap();
        assert_eq!(cache.incr("poison", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_advisory_lock_serializes_writers() {
        let cache = Arc::new(MemoryCache::default());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = cache.advisory_lock("k").await.unwrap();
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(cache.lock_table().is_empty());
    }

    #[tokio::test]
    async fn test_advisory_lock_released_on_panic() {
        let cache = Arc::new(MemoryCache::default());
        let c = cache.clone();
        let result = tokio::spawn(async move {
            let _guard = c.advisory_lock("k").await.unwrap();
            panic!("codec failure");
        })
        .await;
        assert!(result.is_err());

        let guard = tokio::time::timeout(Duration::from_secs(1), cache.advisory_lock("k"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(guard.key(), "k");
    }
}
