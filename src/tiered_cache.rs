//! Two-tier object cache
//!
//! A request-local map sits in front of a shared [`RemoteCache`]:
//! - Local tier: group -> (composite key -> payload), never expires on its own
//! - Remote tier: authoritative store with TTLs
//!
//! Reads consult the local tier first and populate it from the remote tier.
//! Writes go to both tiers, local first. The two tiers are not kept
//! consistent when a remote call fails.
//!
//! Values are stored as `serde_json` payloads so numbers written through
//! [`TieredCache::set`] are usable by the remote counter operations.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info, warn};

use crate::CacheError;
use crate::config::{CacheConfig, DEFAULT_TTL_SECS};
use crate::namespace::KeyNamespacer;
use crate::remote::{self, RemoteCache, Stats};

/// Group used when the caller has no better namespace
pub const DEFAULT_GROUP: &str = "default";

/// Outcome of a cache read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    /// Served from the local tier without a remote call
    Local(V),
    /// Read from the remote tier; the local tier now holds it too
    Remote(V),
    /// The remote tier reported the key absent
    Miss,
}

impl<V> Lookup<V> {
    pub fn found(&self) -> bool {
        !matches!(self, Lookup::Miss)
    }

    pub fn value(&self) -> Option<&V> {
        match self {
            Lookup::Local(v) | Lookup::Remote(v) => Some(v),
            Lookup::Miss => None,
        }
    }

    pub fn into_value(self) -> Option<V> {
        match self {
            Lookup::Local(v) | Lookup::Remote(v) => Some(v),
            Lookup::Miss => None,
        }
    }
}

/// Local tier in front of a remote cache, scoped to one tenant.
///
/// One owner at a time: every operation takes `&mut self`. Give each
/// request context its own instance and share only the remote store.
pub struct TieredCache<R: RemoteCache> {
    remote: R,
    namespacer: KeyNamespacer,
    default_ttl: u32,
    local: HashMap<String, HashMap<String, Bytes>>,
}

impl TieredCache<Box<dyn RemoteCache>> {
    /// Build the remote client described by `config` and wrap it.
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        let remote = remote::connect(config).await?;
        Ok(Self::new(remote, KeyNamespacer::new(config.tenant.as_deref()))
            .with_default_ttl(config.default_ttl_secs))
    }
}

impl<R: RemoteCache> TieredCache<R> {
    pub fn new(remote: R, namespacer: KeyNamespacer) -> Self {
        Self {
            remote,
            namespacer,
            default_ttl: DEFAULT_TTL_SECS,
            local: HashMap::new(),
        }
    }

    /// Remote TTL used for writes that pass expiration 0
    pub fn with_default_ttl(mut self, secs: u32) -> Self {
        self.default_ttl = secs;
        self
    }

    pub fn namespacer(&self) -> &KeyNamespacer {
        &self.namespacer
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Composite key for `key` in `group` under this cache's tenant
    pub fn derive_key(&self, key: &str, group: &str) -> String {
        self.namespacer.derive(key, group)
    }

    /// Number of entries held in the local tier
    pub fn local_len(&self) -> usize {
        self.local.values().map(HashMap::len).sum()
    }

    /// Store `value` only if the key does not resolve to a value yet.
    ///
    /// The existence check reads through to the remote tier and may fill the
    /// local tier even when this returns [`CacheError::AlreadyExists`].
    pub async fn add<V: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &V,
        group: &str,
        expire: u32,
    ) -> Result<(), CacheError> {
        let composite = self.derive_key(key, group);
        if self.exists_composite(&composite, group).await {
            debug!("add skipped, key exists: {}", composite);
            return Err(CacheError::AlreadyExists);
        }
        self.set_composite(composite, value, group, expire).await
    }

    /// Read a value, local tier first unless `force` is set.
    ///
    /// A remote miss leaves the local tier untouched, including a stale
    /// local entry skipped by `force`. A remote hit is stored locally even
    /// when it does not decode as `V`, so [`TieredCache::exists`] and
    /// [`TieredCache::add`] still see the key.
    pub async fn get<V: DeserializeOwned>(
        &mut self,
        key: &str,
        group: &str,
        force: bool,
    ) -> Result<Lookup<V>, CacheError> {
        let composite = self.derive_key(key, group);

        if !force && let Some(payload) = self.local_entry(&composite, group) {
            debug!("Cache hit local for key: {}", composite);
            return Ok(Lookup::Local(serde_json::from_slice(payload)?));
        }

        let payload = match self.remote.get(&composite).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!("Cache miss remote for key: {}", composite);
                return Ok(Lookup::Miss);
            }
            Err(e) => {
                warn!("Remote GET error for key {}: {}", composite, e);
                return Err(e.into());
            }
        };

        debug!("Cache hit remote for key: {}", composite);
        let value = serde_json::from_slice(&payload);
        self.local
            .entry(group.to_owned())
            .or_default()
            .insert(composite, payload);
        Ok(Lookup::Remote(value?))
    }

    /// Write through both tiers. `expire` 0 uses the default TTL.
    ///
    /// The local tier keeps the value even when the remote write fails.
    pub async fn set<V: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &V,
        group: &str,
        expire: u32,
    ) -> Result<(), CacheError> {
        let composite = self.derive_key(key, group);
        self.set_composite(composite, value, group, expire).await
    }

    /// Remove a key from both tiers. `Ok(false)` when the remote tier had
    /// nothing to delete.
    pub async fn delete(&mut self, key: &str, group: &str) -> Result<bool, CacheError> {
        let composite = self.derive_key(key, group);
        if let Some(entries) = self.local.get_mut(group) {
            entries.remove(&composite);
        }
        match self.remote.delete(&composite).await {
            Ok(removed) => {
                debug!("Deleted key {} (remote had it: {})", composite, removed);
                Ok(removed)
            }
            Err(e) => {
                warn!("Remote DELETE error for key {}: {}", composite, e);
                Err(e.into())
            }
        }
    }

    /// Clear the whole local tier and the whole remote store, every tenant
    /// and group included.
    pub async fn flush(&mut self) -> Result<(), CacheError> {
        self.local.clear();
        match self.remote.flush().await {
            Ok(()) => {
                info!("Cache flushed");
                Ok(())
            }
            Err(e) => {
                warn!("Remote FLUSH error: {}", e);
                Err(e.into())
            }
        }
    }

    /// Whether the key resolves to a value. Reads through and fills the
    /// local tier like [`TieredCache::get`]; remote errors count as absent.
    pub async fn exists(&mut self, key: &str, group: &str) -> bool {
        let composite = self.derive_key(key, group);
        self.exists_composite(&composite, group).await
    }

    /// Add `offset` to the remote counter stored under `composite_key`.
    ///
    /// The key is used as-is, derive it with [`TieredCache::derive_key`].
    /// The local tier is not consulted or updated.
    pub async fn increment(&self, composite_key: &str, offset: u64) -> Result<u64, CacheError> {
        match self.remote.increment(composite_key, offset).await {
            Ok(Some(v)) => Ok(v),
            Ok(None) => Err(CacheError::NotFound),
            Err(e) => {
                warn!("Remote INCR error for key {}: {}", composite_key, e);
                Err(e.into())
            }
        }
    }

    /// Subtract `offset` from the remote counter under `composite_key`,
    /// stopping at zero. Same key rules as [`TieredCache::increment`].
    pub async fn decrement(&self, composite_key: &str, offset: u64) -> Result<u64, CacheError> {
        match self.remote.decrement(composite_key, offset).await {
            Ok(Some(v)) => Ok(v),
            Ok(None) => Err(CacheError::NotFound),
            Err(e) => {
                warn!("Remote DECR error for key {}: {}", composite_key, e);
                Err(e.into())
            }
        }
    }

    /// Remote server statistics
    pub async fn stats(&self) -> Result<Stats, CacheError> {
        Ok(self.remote.stats().await?)
    }

    /// Close the remote connection. The local tier is dropped with `self`.
    pub async fn close(self) -> Result<(), CacheError> {
        self.remote.quit().await?;
        info!("Cache closed");
        Ok(())
    }

    fn local_entry(&self, composite: &str, group: &str) -> Option<&Bytes> {
        self.local
            .get(group)
            .and_then(|entries| entries.get(composite))
    }

    async fn exists_composite(&mut self, composite: &str, group: &str) -> bool {
        if self.local_entry(composite, group).is_some() {
            return true;
        }
        match self.remote.get(composite).await {
            Ok(Some(payload)) => {
                self.local
                    .entry(group.to_owned())
                    .or_default()
                    .insert(composite.to_owned(), payload);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Remote GET error for key {}: {}", composite, e);
                false
            }
        }
    }

    async fn set_composite<V: Serialize + ?Sized>(
        &mut self,
        composite: String,
        value: &V,
        group: &str,
        expire: u32,
    ) -> Result<(), CacheError> {
        let payload = Bytes::from(serde_json::to_vec(value)?);
        let ttl = if expire == 0 { self.default_ttl } else { expire };

        self.local
            .entry(group.to_owned())
            .or_default()
            .insert(composite.clone(), payload.clone());

        match self.remote.set(&composite, payload, ttl).await {
            Ok(()) => {
                debug!("Stored key {} with ttl {}s", composite, ttl);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Remote SET error for key {}: {}. Local tier kept the value.",
                    composite, e
                );
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::memory_remote::MemoryRemote;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts remote calls made through it
    #[derive(Clone, Default)]
    pub(crate) struct Recording {
        pub inner: MemoryRemote,
        pub gets: Arc<AtomicUsize>,
        pub sets: Arc<AtomicUsize>,
    }

    impl Recording {
        pub(crate) fn gets(&self) -> usize {
            self.gets.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteCache for Recording {
        async fn get(&self, key: &str) -> Result<Option<Bytes>, RemoteError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: Bytes, ttl_secs: u32) -> Result<(), RemoteError> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, value, ttl_secs).await
        }
        async fn delete(&self, key: &str) -> Result<bool, RemoteError> {
            self.inner.delete(key).await
        }
        async fn increment(&self, key: &str, delta: u64) -> Result<Option<u64>, RemoteError> {
            self.inner.increment(key, delta).await
        }
        async fn decrement(&self, key: &str, delta: u64) -> Result<Option<u64>, RemoteError> {
            self.inner.decrement(key, delta).await
        }
        async fn flush(&self) -> Result<(), RemoteError> {
            self.inner.flush().await
        }
        async fn stats(&self) -> Result<Stats, RemoteError> {
            self.inner.stats().await
        }
        async fn quit(&self) -> Result<(), RemoteError> {
            self.inner.quit().await
        }
    }

    /// Remote tier whose every call fails
    pub(crate) struct Unreachable;

    fn down() -> RemoteError {
        RemoteError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ))
    }

    #[async_trait]
    impl RemoteCache for Unreachable {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>, RemoteError> {
            Err(down())
        }
        async fn set(&self, _key: &str, _value: Bytes, _ttl: u32) -> Result<(), RemoteError> {
            Err(down())
        }
        async fn delete(&self, _key: &str) -> Result<bool, RemoteError> {
            Err(down())
        }
        async fn increment(&self, _key: &str, _delta: u64) -> Result<Option<u64>, RemoteError> {
            Err(down())
        }
        async fn decrement(&self, _key: &str, _delta: u64) -> Result<Option<u64>, RemoteError> {
            Err(down())
        }
        async fn flush(&self) -> Result<(), RemoteError> {
            Err(down())
        }
        async fn stats(&self) -> Result<Stats, RemoteError> {
            Err(down())
        }
        async fn quit(&self) -> Result<(), RemoteError> {
            Err(down())
        }
    }

    fn cache(remote: Recording) -> TieredCache<Recording> {
        TieredCache::new(remote, KeyNamespacer::new(None))
    }

    #[tokio::test]
    async fn test_set_then_get_is_served_locally() {
        let remote = Recording::default();
        let mut cache = cache(remote.clone());

        cache
            .set("post_1", "hello", DEFAULT_GROUP, 0)
            .await
            .unwrap();
        let got: Lookup<String> = cache.get("post_1", DEFAULT_GROUP, false).await.unwrap();

        assert_eq!(got, Lookup::Local("hello".to_owned()));
        assert!(got.found());
        assert_eq!(remote.gets(), 0);
        assert_eq!(remote.sets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_reads_through_and_fills_local_tier() {
        let remote = Recording::default();
        remote
            .inner
            .set("posts:7", Bytes::from_static(b"{\"id\":7}"), 0)
            .await
            .unwrap();
        let mut cache = cache(remote.clone());

        let first: Lookup<serde_json::Value> = cache.get("7", "posts", false).await.unwrap();
        assert_eq!(first, Lookup::Remote(serde_json::json!({"id": 7})));
        assert_eq!(cache.local_len(), 1);

        let second: Lookup<serde_json::Value> = cache.get("7", "posts", false).await.unwrap();
        assert!(matches!(second, Lookup::Local(_)));
        assert_eq!(remote.gets(), 1);
    }

    #[tokio::test]
    async fn test_miss_does_not_touch_local_tier() {
        let remote = Recording::default();
        let mut cache = cache(remote.clone());

        let got: Lookup<u32> = cache.get("nope", DEFAULT_GROUP, false).await.unwrap();
        assert_eq!(got, Lookup::Miss);
        assert!(!got.found());
        assert_eq!(got.value(), None);
        assert_eq!(cache.local_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_uses_default_ttl_for_zero() {
        let remote = Recording::default();
        let mut cache = cache(remote.clone()).with_default_ttl(1);
        cache.set("a", &1, DEFAULT_GROUP, 0).await.unwrap();
        cache.set("b", &1, DEFAULT_GROUP, 100).await.unwrap();

        tokio::time::advance(std::time::Duration::from_secs(2)).await;
        assert!(remote.inner.get("default:a").await.unwrap().is_none());
        assert!(remote.inner.get("default:b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_repeated_delete_of_absent_key() {
        let remote = Recording::default();
        let mut cache = cache(remote.clone());

        assert!(!cache.delete("ghost", DEFAULT_GROUP).await.unwrap());
        assert!(!cache.delete("ghost", DEFAULT_GROUP).await.unwrap());
        assert!(!cache.exists("ghost", DEFAULT_GROUP).await);
        assert!(remote.inner.is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_both_tiers() {
        let remote = Recording::default();
        let mut cache = cache(remote.clone());
        cache.set("k", "v", "g", 0).await.unwrap();

        assert!(cache.delete("k", "g").await.unwrap());
        assert_eq!(cache.local_len(), 0);
        let got: Lookup<String> = cache.get("k", "g", false).await.unwrap();
        assert_eq!(got, Lookup::Miss);
    }

    #[tokio::test]
    async fn test_add_is_exclusive() {
        let remote = Recording::default();
        let mut cache = cache(remote.clone());

        cache.add("k", "v1", DEFAULT_GROUP, 0).await.unwrap();
        let err = cache.add("k", "v2", DEFAULT_GROUP, 0).await.unwrap_err();
        assert!(matches!(err, CacheError::AlreadyExists));

        let got: Lookup<String> = cache.get("k", DEFAULT_GROUP, false).await.unwrap();
        assert_eq!(got.into_value().as_deref(), Some("v1"));
        let remote_value: Lookup<String> = cache.get("k", DEFAULT_GROUP, true).await.unwrap();
        assert_eq!(remote_value, Lookup::Remote("v1".to_owned()));
    }

    #[tokio::test]
    async fn test_add_fills_local_tier_when_key_exists_remotely() {
        let remote = Recording::default();
        remote
            .inner
            .set("default:k", Bytes::from_static(b"\"other\""), 0)
            .await
            .unwrap();
        let mut cache = cache(remote.clone());

        assert!(matches!(
            cache.add("k", "mine", DEFAULT_GROUP, 0).await,
            Err(CacheError::AlreadyExists)
        ));
        assert_eq!(cache.local_len(), 1);
        let got: Lookup<String> = cache.get("k", DEFAULT_GROUP, false).await.unwrap();
        assert_eq!(got, Lookup::Local("other".to_owned()));
    }

    #[tokio::test]
    async fn test_force_read_bypasses_stale_local_value() {
        let remote = Recording::default();
        let mut cache = cache(remote.clone());
        cache.set("k", "old", DEFAULT_GROUP, 0).await.unwrap();
        remote
            .inner
            .set("default:k", Bytes::from_static(b"\"new\""), 0)
            .await
            .unwrap();

        let stale: Lookup<String> = cache.get("k", DEFAULT_GROUP, false).await.unwrap();
        assert_eq!(stale, Lookup::Local("old".to_owned()));

        let fresh: Lookup<String> = cache.get("k", DEFAULT_GROUP, true).await.unwrap();
        assert_eq!(fresh, Lookup::Remote("new".to_owned()));

        let now_local: Lookup<String> = cache.get("k", DEFAULT_GROUP, false).await.unwrap();
        assert_eq!(now_local, Lookup::Local("new".to_owned()));
    }

    #[tokio::test]
    async fn test_forced_miss_keeps_stale_local_entry() {
        let remote = Recording::default();
        let mut cache = cache(remote.clone());
        cache.set("k", "old", DEFAULT_GROUP, 0).await.unwrap();
        remote.inner.delete("default:k").await.unwrap();

        let forced: Lookup<String> = cache.get("k", DEFAULT_GROUP, true).await.unwrap();
        assert_eq!(forced, Lookup::Miss);
        let local: Lookup<String> = cache.get("k", DEFAULT_GROUP, false).await.unwrap();
        assert_eq!(local, Lookup::Local("old".to_owned()));
    }

    #[tokio::test]
    async fn test_flush_clears_every_group() {
        let remote = Recording::default();
        let mut cache = cache(remote.clone());
        cache.set("a", &1, "g1", 0).await.unwrap();
        cache.set("b", &2, "g2", 0).await.unwrap();

        cache.flush().await.unwrap();

        let a: Lookup<i32> = cache.get("a", "g1", false).await.unwrap();
        let b: Lookup<i32> = cache.get("b", "g2", false).await.unwrap();
        assert!(!a.found());
        assert!(!b.found());
        assert_eq!(cache.local_len(), 0);
    }

    #[tokio::test]
    async fn test_tenants_sharing_a_remote_store_stay_isolated() {
        let shared = MemoryRemote::new();
        let mut tenant_a = TieredCache::new(shared.clone(), KeyNamespacer::new(Some("1")));
        let mut tenant_b = TieredCache::new(shared.clone(), KeyNamespacer::new(Some("2")));

        tenant_a.set("x", &1, DEFAULT_GROUP, 0).await.unwrap();
        tenant_b.set("x", &2, DEFAULT_GROUP, 0).await.unwrap();
        assert_eq!(shared.len(), 2);

        let a: Lookup<i32> = tenant_a.get("x", DEFAULT_GROUP, true).await.unwrap();
        let b: Lookup<i32> = tenant_b.get("x", DEFAULT_GROUP, true).await.unwrap();
        assert_eq!(a.into_value(), Some(1));
        assert_eq!(b.into_value(), Some(2));
    }

    #[tokio::test]
    async fn test_counter_on_derived_key() {
        let remote = Recording::default();
        let mut cache = cache(remote.clone());
        cache.set("n", &10u64, DEFAULT_GROUP, 0).await.unwrap();

        let key = cache.derive_key("n", DEFAULT_GROUP);
        assert_eq!(cache.increment(&key, 5).await.unwrap(), 15);
        assert_eq!(
            remote.inner.get(&key).await.unwrap(),
            Some(Bytes::from_static(b"15"))
        );

        // counters bypass the local tier
        let local: Lookup<u64> = cache.get("n", DEFAULT_GROUP, false).await.unwrap();
        assert_eq!(local, Lookup::Local(10));
        let remote_value: Lookup<u64> = cache.get("n", DEFAULT_GROUP, true).await.unwrap();
        assert_eq!(remote_value, Lookup::Remote(15));

        assert_eq!(cache.decrement(&key, 20).await.unwrap(), 0);
        assert!(matches!(
            cache.increment("default:missing", 1).await,
            Err(CacheError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_wrong_type_is_a_serialization_error() {
        let remote = Recording::default();
        let mut cache = cache(remote);
        cache.set("k", "text", DEFAULT_GROUP, 0).await.unwrap();
        let err = cache
            .get::<u32>("k", DEFAULT_GROUP, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_undecodable_remote_value_still_fills_local_tier() {
        let remote = Recording::default();
        remote
            .inner
            .set("default:k", Bytes::from_static(b"plain text"), 0)
            .await
            .unwrap();
        let mut cache = cache(remote.clone());

        let err = cache
            .get::<String>("k", DEFAULT_GROUP, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
        assert_eq!(cache.local_len(), 1);

        assert!(cache.exists("k", DEFAULT_GROUP).await);
        assert!(matches!(
            cache.add("k", "mine", DEFAULT_GROUP, 0).await,
            Err(CacheError::AlreadyExists)
        ));
        assert_eq!(remote.gets(), 1);
    }

    #[tokio::test]
    async fn test_remote_failure_degrades() {
        let mut cache = TieredCache::new(Unreachable, KeyNamespacer::new(None));

        let err = cache.set("k", "v", DEFAULT_GROUP, 0).await.unwrap_err();
        assert!(matches!(err, CacheError::Remote(_)));
        // the local tier keeps the write
        let got: Lookup<String> = cache.get("k", DEFAULT_GROUP, false).await.unwrap();
        assert_eq!(got, Lookup::Local("v".to_owned()));

        assert!(cache.get::<String>("k", DEFAULT_GROUP, true).await.is_err());
        assert!(cache.exists("k", DEFAULT_GROUP).await);
        assert!(!cache.exists("other", DEFAULT_GROUP).await);
        assert!(cache.delete("k", DEFAULT_GROUP).await.is_err());
        assert_eq!(cache.local_len(), 0);
        assert!(cache.flush().await.is_err());
        assert!(cache.stats().await.is_err());
        assert!(cache.close().await.is_err());
    }

    #[tokio::test]
    async fn test_stats_and_close() {
        let remote = Recording::default();
        let mut cache = cache(remote);
        cache.set("k", &1, DEFAULT_GROUP, 0).await.unwrap();
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats[crate::memory_remote::MEMORY_ADDR]["curr_items"], "1");
        cache.close().await.unwrap();
    }
}
