//! Remote tier abstraction
//!
//! The facade only ever talks to the shared store through [`RemoteCache`].
//! Keys handed to it are already composite keys and values are opaque
//! payloads; TTLs are whole seconds.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{CacheConfig, RemoteKind};
use crate::error::RemoteError;
use crate::memcached::MemcachedRemote;
use crate::redis_remote::RedisRemote;

/// TTLs above this many seconds (30 days) are absolute unix timestamps,
/// as memcached reads them
pub const RELATIVE_TTL_LIMIT: u32 = 60 * 60 * 24 * 30;

/// Statistics for one server, name -> value as reported by the server
pub type ServerStats = HashMap<String, String>;

/// Statistics snapshot keyed by server address
pub type Stats = HashMap<String, ServerStats>;

/// Operations the tiered cache needs from the shared store.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Fetch a value. `Ok(None)` means the server reported the key absent.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, RemoteError>;

    /// Store a value unconditionally. `ttl_secs` of 0 never expires; above
    /// [`RELATIVE_TTL_LIMIT`] it is an absolute unix timestamp.
    async fn set(&self, key: &str, value: Bytes, ttl_secs: u32) -> Result<(), RemoteError>;

    /// Remove a value. `Ok(false)` means there was nothing to remove.
    async fn delete(&self, key: &str) -> Result<bool, RemoteError>;

    /// Atomically add to a decimal counter. `Ok(None)` if the key is absent.
    async fn increment(&self, key: &str, delta: u64) -> Result<Option<u64>, RemoteError>;

    /// Atomically subtract from a decimal counter, stopping at zero.
    /// `Ok(None)` if the key is absent.
    async fn decrement(&self, key: &str, delta: u64) -> Result<Option<u64>, RemoteError>;

    /// Drop every entry in the store.
    async fn flush(&self) -> Result<(), RemoteError>;

    /// Per-server statistics.
    async fn stats(&self) -> Result<Stats, RemoteError>;

    /// Close the connections held by this client.
    async fn quit(&self) -> Result<(), RemoteError>;
}

#[async_trait]
impl<T: RemoteCache + ?Sized> RemoteCache for Box<T> {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, RemoteError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl_secs: u32) -> Result<(), RemoteError> {
        (**self).set(key, value, ttl_secs).await
    }

    async fn delete(&self, key: &str) -> Result<bool, RemoteError> {
        (**self).delete(key).await
    }

    async fn increment(&self, key: &str, delta: u64) -> Result<Option<u64>, RemoteError> {
        (**self).increment(key, delta).await
    }

    async fn decrement(&self, key: &str, delta: u64) -> Result<Option<u64>, RemoteError> {
        (**self).decrement(key, delta).await
    }

    async fn flush(&self) -> Result<(), RemoteError> {
        (**self).flush().await
    }

    async fn stats(&self) -> Result<Stats, RemoteError> {
        (**self).stats().await
    }

    async fn quit(&self) -> Result<(), RemoteError> {
        (**self).quit().await
    }
}

/// Build the remote client selected by `config.backend`.
pub async fn connect(config: &CacheConfig) -> Result<Box<dyn RemoteCache>, RemoteError> {
    match config.backend {
        RemoteKind::Memcached => Ok(Box::new(MemcachedRemote::new(
            &config.servers,
            config.connect_timeout(),
            config.io_timeout(),
        )?)),
        RemoteKind::Redis => {
            let server = config.servers.first().ok_or(RemoteError::NoServers)?;
            Ok(Box::new(RedisRemote::connect(server).await?))
        }
    }
}
