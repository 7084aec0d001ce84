//! In-process TTL cache (C2). No external cache dependency; callers get a
//! `Cache<K, V>` backed by an `RwLock<HashMap>` and entries expire lazily
//! on read, matching the short-lived, read-heavy EPG lookups it backs
//! (current program, schedule ranges).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A generic, TTL-bounded cache. Cloning is cheap — it shares the
/// underlying map via `Arc`.
#[derive(Clone)]
pub struct Cache<K, V> {
    entries: Arc<RwLock<HashMap<K, Entry<V>>>>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self { entries: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        entries.get(key).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    pub async fn put(&self, key: K, value: V, ttl: Duration) {
        let mut entries = self.entries.write().await;
        entries.insert(key, Entry { value, expires_at: Instant::now() + ttl });
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.write().await.remove(key);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn keys(&self) -> Vec<K> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Drops expired entries. Called opportunistically rather than on a
    /// timer — there is no background sweep task for this cache, unlike
    /// the session manager's idle sweep.
    pub async fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries.write().await.retain(|_, entry| entry.expires_at > now);
    }
}

impl<K, V> Default for Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Cache<String, V>
where
    V: Clone,
{
    /// Drops every entry whose key starts with `prefix`. Backs the
    /// `epg:*` invalidation the ingester fires on a successful refresh
    /// (§4.9 step 9) — the in-process cache has no real `keys` glob, so
    /// this walks and filters instead.
    pub async fn invalidate_prefix(&self, prefix: &str) {
        self.entries.write().await.retain(|key, _| !key.starts_with(prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_entry_is_not_returned() {
        let cache: Cache<String, i32> = Cache::new();
        cache.put("a".to_string(), 1, Duration::from_millis(10)).await;
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get(&"a".to_string()).await, None);
    }

    #[tokio::test]
    async fn invalidate_removes_entry_immediately() {
        let cache: Cache<String, i32> = Cache::new();
        cache.put("a".to_string(), 1, Duration::from_secs(60)).await;
        cache.invalidate(&"a".to_string()).await;
        assert_eq!(cache.get(&"a".to_string()).await, None);
    }

    #[tokio::test]
    async fn invalidate_prefix_only_clears_matching_keys() {
        let cache: Cache<String, i32> = Cache::new();
        cache.put("epg:now:1".to_string(), 1, Duration::from_secs(60)).await;
        cache.put("epg:next:1".to_string(), 2, Duration::from_secs(60)).await;
        cache.put("other:1".to_string(), 3, Duration::from_secs(60)).await;
        cache.invalidate_prefix("epg:").await;
        assert_eq!(cache.get(&"epg:now:1".to_string()).await, None);
        assert_eq!(cache.get(&"epg:next:1".to_string()).await, None);
        assert_eq!(cache.get(&"other:1".to_string()).await, Some(3));
    }
}
