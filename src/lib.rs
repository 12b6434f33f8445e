//! ocache - Two-tier object cache
//!
//! This library lets a content-management host keep its object cache in a
//! shared memory cache cluster instead of process-local memory:
//! - Local tier: request-local map, never expires on its own
//! - Remote tier: memcached (binary protocol) or Redis, shared across instances
//!
//! The cache supports:
//! - Tenant and group scoped composite keys
//! - Read-through and write-through between the tiers
//! - Remote atomic counters, statistics and flush
//! - A degraded-mode host API that turns failures into `false` / `None`

mod config;
mod error;
pub mod memcached;
pub mod memory_remote;
mod namespace;
pub mod object_cache;
pub mod redis_remote;
pub mod remote;
pub mod tiered_cache;

pub use config::{CacheConfig, DEFAULT_TTL_SECS, ENV_PREFIX, RemoteKind};
pub use error::{CacheError, RemoteError};
pub use memcached::MemcachedRemote;
pub use memory_remote::MemoryRemote;
pub use namespace::KeyNamespacer;
pub use object_cache::ObjectCache;
pub use redis_remote::RedisRemote;
pub use remote::{RemoteCache, ServerStats, Stats};
pub use tiered_cache::{DEFAULT_GROUP, Lookup, TieredCache};

// Re-export async_trait for custom remote tiers
pub use async_trait::async_trait;
