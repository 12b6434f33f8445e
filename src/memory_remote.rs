//! In-process remote tier
//!
//! Emulates a single memcached node in shared memory: TTLs in seconds
//! (values above 30 days are absolute unix timestamps, 0 never expires),
//! decimal counters that wrap on increment and stop at zero on decrement.
//! Clones share one store, so several caches can observe the same data.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::debug;

use crate::error::RemoteError;
use crate::memcached::MAX_KEY_LEN;
use crate::remote::{RELATIVE_TTL_LIMIT, RemoteCache, ServerStats, Stats};

/// Address reported in [`RemoteCache::stats`]
pub const MEMORY_ADDR: &str = "memory";

#[derive(Debug, Clone)]
struct Item {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Item {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Debug, Default)]
struct Inner {
    items: HashMap<String, Item>,
    get_hits: u64,
    get_misses: u64,
    cmd_set: u64,
}

/// Shared in-memory store implementing [`RemoteCache`].
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().items.values().filter(|i| i.live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section leaves the map consistent, so poisoning is ignored.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expiry(ttl_secs: u32) -> Option<Instant> {
        match ttl_secs {
            0 => None,
            t if t <= RELATIVE_TTL_LIMIT => Some(Instant::now() + Duration::from_secs(t.into())),
            t => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                let remaining = u64::from(t).saturating_sub(now);
                Some(Instant::now() + Duration::from_secs(remaining))
            }
        }
    }

    fn check_key(key: &str) -> Result<(), RemoteError> {
        if key.len() > MAX_KEY_LEN {
            return Err(RemoteError::KeyTooLong(key.len()));
        }
        Ok(())
    }

    fn counter(
        &self,
        key: &str,
        apply: impl FnOnce(u64) -> u64,
    ) -> Result<Option<u64>, RemoteError> {
        Self::check_key(key)?;
        let now = Instant::now();
        let mut inner = self.lock();
        let Some(item) = inner.items.get_mut(key).filter(|i| i.live(now)) else {
            return Ok(None);
        };
        let current = std::str::from_utf8(&item.value)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or(RemoteError::NonNumeric)?;
        let next = apply(current);
        item.value = Bytes::from(next.to_string());
        Ok(Some(next))
    }
}

#[async_trait]
impl RemoteCache for MemoryRemote {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, RemoteError> {
        Self::check_key(key)?;
        let now = Instant::now();
        let mut inner = self.lock();
        let found = match inner.items.get(key).map(|item| item.live(now)) {
            Some(true) => inner.items.get(key).map(|item| item.value.clone()),
            Some(false) => {
                debug!("memory remote: {} expired", key);
                inner.items.remove(key);
                None
            }
            None => None,
        };
        if found.is_some() {
            inner.get_hits += 1;
        } else {
            inner.get_misses += 1;
        }
        Ok(found)
    }

    async fn set(&self, key: &str, value: Bytes, ttl_secs: u32) -> Result<(), RemoteError> {
        Self::check_key(key)?;
        let item = Item {
            value,
            expires_at: Self::expiry(ttl_secs),
        };
        let mut inner = self.lock();
        inner.cmd_set += 1;
        inner.items.insert(key.to_owned(), item);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, RemoteError> {
        Self::check_key(key)?;
        let now = Instant::now();
        Ok(self
            .lock()
            .items
            .remove(key)
            .is_some_and(|item| item.live(now)))
    }

    async fn increment(&self, key: &str, delta: u64) -> Result<Option<u64>, RemoteError> {
        self.counter(key, |v| v.wrapping_add(delta))
    }

    async fn decrement(&self, key: &str, delta: u64) -> Result<Option<u64>, RemoteError> {
        self.counter(key, |v| v.saturating_sub(delta))
    }

    async fn flush(&self) -> Result<(), RemoteError> {
        self.lock().items.clear();
        Ok(())
    }

    async fn stats(&self) -> Result<Stats, RemoteError> {
        let now = Instant::now();
        let inner = self.lock();
        let live = inner.items.values().filter(|i| i.live(now)).count();
        let mut server = ServerStats::new();
        server.insert("curr_items".to_owned(), live.to_string());
        server.insert("get_hits".to_owned(), inner.get_hits.to_string());
        server.insert("get_misses".to_owned(), inner.get_misses.to_string());
        server.insert("cmd_set".to_owned(), inner.cmd_set.to_string());
        Ok(Stats::from([(MEMORY_ADDR.to_owned(), server)]))
    }

    async fn quit(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}
