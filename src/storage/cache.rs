// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Key/value cache with per-entry TTL.
//!
//! The auth core only depends on [`KeyValueCache`]; the in-process
//! [`LruKeyValueCache`] is the default backend.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;

/// Error type for cache backends.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Serialized-blob cache. Failures are expected to be treated as misses.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

struct CacheEntry {
    value: String,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.inserted_at.elapsed() < self.ttl
    }
}

/// In-process LRU cache.
pub struct LruKeyValueCache {
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl LruKeyValueCache {
    /// Create a new cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<String, CacheEntry>>, CacheError> {
        self.cache
            .lock()
            .map_err(|_| CacheError::Unavailable("cache lock poisoned".to_string()))
    }
}

#[async_trait]
impl KeyValueCache for LruKeyValueCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut cache = self.lock()?;
        if let Some(entry) = cache.get(key) {
            if entry.is_fresh() {
                return Ok(Some(entry.value.clone()));
            }
            cache.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut cache = self.lock()?;
        cache.put(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.lock()?.pop(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let cache = LruKeyValueCache::new(10);
        assert!(cache.get("user:1").await.unwrap().is_none());

        cache
            .set("user:1", "payload".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("user:1").await.unwrap().as_deref(), Some("payload"));

        cache.delete("user:1").await.unwrap();
        assert!(cache.get("user:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = LruKeyValueCache::new(10);
        cache
            .set("user:1", "payload".to_string(), Duration::from_millis(1))
            .await
            .unwrap();

        std::thread::sleep(Duration::from_millis(5));

        assert!(cache.get("user:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn least_recently_used_is_evicted() {
        let cache = LruKeyValueCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.set("a", "1".to_string(), ttl).await.unwrap();
        cache.set("b", "2".to_string(), ttl).await.unwrap();
        cache.get("a").await.unwrap();
        cache.set("c", "3".to_string(), ttl).await.unwrap();

        assert!(cache.get("a").await.unwrap().is_some());
        assert!(cache.get("b").await.unwrap().is_none());
        assert!(cache.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn zero_capacity_still_caches_one_entry() {
        let cache = LruKeyValueCache::new(0);
        cache
            .set("a", "1".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.get("a").await.unwrap().is_some());
    }
}
