//! Host-facing object cache API
//!
//! The calls a content-management host makes instead of using its own
//! in-process object cache. Every call degrades to a failure value
//! (`false` / `None`) instead of returning an error, so the host can fall
//! back to its authoritative data source when the cache is unavailable.
//!
//! There is no global instance: the host builds one [`ObjectCache`] per
//! request context with [`ObjectCache::init`] and passes it along.

use serde::{Serialize, de::DeserializeOwned};
use tracing::warn;

use crate::CacheError;
use crate::config::CacheConfig;
use crate::remote::{RemoteCache, Stats};
use crate::tiered_cache::{Lookup, TieredCache};

/// Per-context cache handle for the host application.
pub struct ObjectCache<R: RemoteCache = Box<dyn RemoteCache>> {
    cache: Option<TieredCache<R>>,
}

impl ObjectCache {
    /// Connect to the configured remote tier for the current context.
    pub async fn init(config: &CacheConfig) -> Result<Self, CacheError> {
        Ok(Self::from_cache(TieredCache::connect(config).await?))
    }
}

impl<R: RemoteCache> ObjectCache<R> {
    pub fn from_cache(cache: TieredCache<R>) -> Self {
        Self { cache: Some(cache) }
    }

    /// Whether [`ObjectCache::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.cache.is_none()
    }

    fn cache(&mut self) -> Result<&mut TieredCache<R>, CacheError> {
        self.cache.as_mut().ok_or(CacheError::Closed)
    }

    /// Store only if absent. `false` when the key exists or the write failed.
    pub async fn add<V: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &V,
        group: &str,
        expire: u32,
    ) -> bool {
        let result = match self.cache() {
            Ok(cache) => cache.add(key, value, group, expire).await,
            Err(e) => Err(e),
        };
        succeeded("add", key, result)
    }

    /// Read a value; `None` on a miss, a remote failure or a type mismatch.
    pub async fn get<V: DeserializeOwned>(
        &mut self,
        key: &str,
        group: &str,
        force: bool,
    ) -> Option<V> {
        self.lookup(key, group, force).await.into_value()
    }

    /// Read a value, keeping track of which tier served it.
    pub async fn lookup<V: DeserializeOwned>(
        &mut self,
        key: &str,
        group: &str,
        force: bool,
    ) -> Lookup<V> {
        let result = match self.cache() {
            Ok(cache) => cache.get(key, group, force).await,
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| {
            warn!("object cache get {} failed: {}", key, e);
            Lookup::Miss
        })
    }

    /// Write through both tiers; `false` when the remote write failed.
    pub async fn set<V: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &V,
        group: &str,
        expire: u32,
    ) -> bool {
        let result = match self.cache() {
            Ok(cache) => cache.set(key, value, group, expire).await,
            Err(e) => Err(e),
        };
        succeeded("set", key, result)
    }

    /// Same as [`ObjectCache::set`]
    pub async fn replace<V: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &V,
        group: &str,
        expire: u32,
    ) -> bool {
        self.set(key, value, group, expire).await
    }

    /// `true` only when the remote tier removed the key.
    pub async fn delete(&mut self, key: &str, group: &str) -> bool {
        let result = match self.cache() {
            Ok(cache) => cache.delete(key, group).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(removed) => removed,
            Err(e) => {
                warn!("object cache delete {} failed: {}", key, e);
                false
            }
        }
    }

    pub async fn flush(&mut self) -> bool {
        let result = match self.cache() {
            Ok(cache) => cache.flush().await,
            Err(e) => Err(e),
        };
        succeeded("flush", "*", result)
    }

    /// Increment the counter for `key` in `group`; `None` if it is missing
    /// or not numeric.
    pub async fn incr(&mut self, key: &str, offset: u64, group: &str) -> Option<u64> {
        let result = match self.cache() {
            Ok(cache) => {
                let composite = cache.derive_key(key, group);
                cache.increment(&composite, offset).await
            }
            Err(e) => Err(e),
        };
        counter("incr", key, result)
    }

    /// Decrement the counter for `key` in `group`, stopping at zero.
    pub async fn decr(&mut self, key: &str, offset: u64, group: &str) -> Option<u64> {
        let result = match self.cache() {
            Ok(cache) => {
                let composite = cache.derive_key(key, group);
                cache.decrement(&composite, offset).await
            }
            Err(e) => Err(e),
        };
        counter("decr", key, result)
    }

    pub async fn stats(&mut self) -> Result<Stats, CacheError> {
        self.cache()?.stats().await
    }

    /// Close the remote connection. Later calls return failure values.
    pub async fn close(&mut self) -> bool {
        let result = match self.cache.take() {
            Some(cache) => cache.close().await,
            None => Err(CacheError::Closed),
        };
        succeeded("close", "*", result)
    }
}

fn succeeded(op: &str, key: &str, result: Result<(), CacheError>) -> bool {
    match result {
        Ok(()) => true,
        Err(CacheError::AlreadyExists) => false,
        Err(e) => {
            warn!("object cache {} {} failed: {}", op, key, e);
            false
        }
    }
}

fn counter(op: &str, key: &str, result: Result<u64, CacheError>) -> Option<u64> {
    match result {
        Ok(v) => Some(v),
        Err(CacheError::NotFound) => None,
        Err(e) => {
            warn!("object cache {} {} failed: {}", op, key, e);
            None
        }
    }
}
