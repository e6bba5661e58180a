//! Distributed cache provider trait.
//!
//! Defines the interface for the second, shared tier of the cache. Any
//! backend (Redis, memcached, an in-process map for tests) can sit behind
//! it; the tiered cache only ever talks to this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::CacheResult;

/// Counters reported by a provider
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Trait for distributed cache backends.
#[async_trait]
pub trait DistributedCacheProvider: Send + Sync {
    /// Fetch a value. Expired entries are reported as absent.
    async fn get(&self, key: &str) -> CacheResult<Option<Value>>;

    /// Store a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> CacheResult<()>;

    /// Remove a value. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Drop every entry.
    async fn clear(&self) -> CacheResult<()>;

    /// Number of live entries.
    async fn size(&self) -> CacheResult<usize>;

    /// Check whether a live entry exists.
    async fn has(&self, key: &str) -> CacheResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Hit/miss counters, when the backend tracks them.
    async fn stats(&self) -> CacheResult<ProviderStats> {
        Ok(ProviderStats {
            entries: self.size().await?,
            ..ProviderStats::default()
        })
    }
}
