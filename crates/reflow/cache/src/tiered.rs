//! Tiered cache: local LRU in front of an optional distributed provider.
//!
//! Reads check the local tier first and fall back to the provider,
//! populating the local tier on a distributed hit. Writes land locally at
//! once and are pushed to the provider on a best-effort basis.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::CacheResult;
use crate::lru::LruCache;
use crate::provider::DistributedCacheProvider;

/// Snapshot of tiered cache counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TieredCacheStats {
    pub local_entries: usize,
    pub local_capacity: usize,
    pub local_hits: u64,
    pub local_misses: u64,
    pub distributed_hits: u64,
    pub distributed_misses: u64,
    /// Provider calls that failed and were treated as misses or skipped
    pub distributed_errors: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    local_hits: AtomicU64,
    local_misses: AtomicU64,
    distributed_hits: AtomicU64,
    distributed_misses: AtomicU64,
    distributed_errors: AtomicU64,
    evictions: AtomicU64,
}

/// Two-tier cache of JSON values keyed by string
pub struct TieredCache {
    local: Mutex<LruCache<String, Value>>,
    distributed: Option<Arc<dyn DistributedCacheProvider>>,
    default_ttl: Option<Duration>,
    counters: Counters,
}

impl TieredCache {
    /// Local-only cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            local: Mutex::new(LruCache::new(capacity)),
            distributed: None,
            default_ttl: None,
            counters: Counters::default(),
        }
    }

    pub fn with_distributed(mut self, provider: Arc<dyn DistributedCacheProvider>) -> Self {
        self.distributed = Some(provider);
        self
    }

    /// TTL passed to the provider when a write does not name one
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn has_distributed(&self) -> bool {
        self.distributed.is_some()
    }

    fn local(&self) -> MutexGuard<'_, LruCache<String, Value>> {
        // LRU operations never panic mid-update
        self.local.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Local tier (synchronous) ─────────────────────────────────────

    pub fn get_local(&self, key: &str) -> Option<Value> {
        let found = self.local().get(key).cloned();
        let counter = if found.is_some() {
            &self.counters.local_hits
        } else {
            &self.counters.local_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn set_local(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if let Some((evicted, _)) = self.local().put(key, value) {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key = %evicted, "Evicted local cache entry");
        }
    }

    pub fn delete_local(&self, key: &str) -> bool {
        self.local().remove(key).is_some()
    }

    pub fn has_local(&self, key: &str) -> bool {
        self.local().contains(key)
    }

    pub fn clear_local(&self) {
        self.local().clear();
    }

    // ── Both tiers (asynchronous) ────────────────────────────────────

    /// Local first, then distributed. A distributed hit is copied locally.
    pub async fn get(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.get_local(key) {
            return Some(value);
        }

        let provider = self.distributed.as_ref()?;
        match provider.get(key).await {
            Ok(Some(value)) => {
                self.counters.distributed_hits.fetch_add(1, Ordering::Relaxed);
                self.set_local(key, value.clone());
                Some(value)
            }
            Ok(None) => {
                self.counters
                    .distributed_misses
                    .fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.record_provider_error("get", key, &e);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: Value) {
        self.set_with_ttl(key, value, None).await;
    }

    /// Write through both tiers. The local write always succeeds.
    pub async fn set_with_ttl(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let Some(provider) = self.distributed.as_ref() else {
            self.set_local(key, value);
            return;
        };
        self.set_local(key, value.clone());
        if let Err(e) = provider.set(key, value, ttl.or(self.default_ttl)).await {
            self.record_provider_error("set", key, &e);
        }
    }

    pub async fn delete(&self, key: &str) {
        self.delete_local(key);
        if let Some(provider) = &self.distributed {
            if let Err(e) = provider.delete(key).await {
                self.record_provider_error("delete", key, &e);
            }
        }
    }

    pub async fn has(&self, key: &str) -> bool {
        if self.has_local(key) {
            return true;
        }
        match &self.distributed {
            Some(provider) => match provider.has(key).await {
                Ok(found) => found,
                Err(e) => {
                    self.record_provider_error("has", key, &e);
                    false
                }
            },
            None => false,
        }
    }

    pub async fn clear(&self) {
        self.clear_local();
        if let Some(provider) = &self.distributed {
            if let Err(e) = provider.clear().await {
                self.record_provider_error("clear", "*", &e);
            }
        }
    }

    // ── Typed helpers ────────────────────────────────────────────────

    /// Fetch and deserialize. A value of the wrong shape is a miss.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    pub async fn set_as<T: Serialize>(&self, key: &str, value: &T) -> CacheResult<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value).await;
        Ok(())
    }

    pub fn stats(&self) -> TieredCacheStats {
        let (local_entries, local_capacity) = {
            let local = self.local();
            (local.len(), local.capacity())
        };
        TieredCacheStats {
            local_entries,
            local_capacity,
            local_hits: self.counters.local_hits.load(Ordering::Relaxed),
            local_misses: self.counters.local_misses.load(Ordering::Relaxed),
            distributed_hits: self.counters.distributed_hits.load(Ordering::Relaxed),
            distributed_misses: self.counters.distributed_misses.load(Ordering::Relaxed),
            distributed_errors: self.counters.distributed_errors.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    fn record_provider_error(&self, op: &str, key: &str, error: &crate::CacheError) {
        self.counters
            .distributed_errors
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(op = op, key = %key, error = %error, "Distributed cache call failed");
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("stats", &self.stats())
            .field("distributed", &self.distributed.is_some())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}
