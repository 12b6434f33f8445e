//! Redis remote tier
//!
//! Lets the two-tier cache sit in front of Redis instead of memcached.
//! Counter commands run as Lua scripts so they keep memcached semantics:
//! a missing key is reported instead of created, and decrement stops at
//! zero. TTLs above 30 days are sent as absolute `EXAT` timestamps, the
//! way memcached reads them. Deltas are limited to `i64::MAX`, the range
//! Redis counters work in.

use async_trait::async_trait;
use bytes::Bytes;
use redis::{AsyncCommands, RedisError, Script};
use tracing::{debug, info};

use crate::error::RemoteError;
use crate::remote::{RELATIVE_TTL_LIMIT, RemoteCache, ServerStats, Stats};

const INCR_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return false end
return redis.call('INCRBY', KEYS[1], ARGV[1])
";

const DECR_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return false end
local n = redis.call('DECRBY', KEYS[1], ARGV[1])
if n < 0 then
  redis.call('SET', KEYS[1], 0, 'KEEPTTL')
  n = 0
end
return n
";

/// Remote tier backed by a single Redis server.
///
/// The connection is held by a [`redis::aio::ConnectionManager`] and is
/// closed when the last handle is dropped; [`RemoteCache::quit`] does not
/// close it on its own.
pub struct RedisRemote {
    addr: String,
    conn: redis::aio::ConnectionManager,
    incr: Script,
    decr: Script,
}

impl RedisRemote {
    /// Connect to `server`, either a `redis://` URL or `host:port`.
    pub async fn connect(server: &str) -> Result<Self, RemoteError> {
        let url = if server.contains("://") {
            server.to_owned()
        } else {
            format!("redis://{}", server)
        };
        let client = redis::Client::open(url.as_str())?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        info!("redis: connected to {}", url);
        Ok(Self {
            addr: server.to_owned(),
            conn,
            incr: Script::new(INCR_SCRIPT),
            decr: Script::new(DECR_SCRIPT),
        })
    }

    async fn counter(
        &self,
        script: &Script,
        key: &str,
        delta: u64,
    ) -> Result<Option<u64>, RemoteError> {
        let delta = script_delta(delta)?;
        let mut conn = self.conn.clone();
        let value: Option<i64> = script
            .key(key)
            .arg(delta)
            .invoke_async(&mut conn)
            .await
            .map_err(counter_error)?;
        value
            .map(|v| u64::try_from(v).map_err(|_| RemoteError::NonNumeric))
            .transpose()
    }
}

/// `SET` with the expiry option matching a memcached TTL.
fn set_cmd(key: &str, value: &[u8], ttl_secs: u32) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    match ttl_secs {
        0 => {}
        t if t <= RELATIVE_TTL_LIMIT => {
            cmd.arg("EX").arg(t);
        }
        t => {
            cmd.arg("EXAT").arg(t);
        }
    }
    cmd
}

fn script_delta(delta: u64) -> Result<i64, RemoteError> {
    i64::try_from(delta).map_err(|_| RemoteError::DeltaOutOfRange(delta))
}

fn counter_error(e: RedisError) -> RemoteError {
    if e.to_string().contains("not an integer") {
        RemoteError::NonNumeric
    } else {
        RemoteError::Redis(e)
    }
}

/// Parse `INFO` output into name -> value pairs.
fn parse_info(info: &str) -> ServerStats {
    info.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
}

#[async_trait]
impl RemoteCache for RedisRemote {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, RemoteError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl_secs: u32) -> Result<(), RemoteError> {
        let mut conn = self.conn.clone();
        set_cmd(key, &value, ttl_secs)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, RemoteError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str, delta: u64) -> Result<Option<u64>, RemoteError> {
        self.counter(&self.incr, key, delta).await
    }

    async fn decrement(&self, key: &str, delta: u64) -> Result<Option<u64>, RemoteError> {
        self.counter(&self.decr, key, delta).await
    }

    async fn flush(&self) -> Result<(), RemoteError> {
        let mut conn = self.conn.clone();
        redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn stats(&self) -> Result<Stats, RemoteError> {
        let mut conn = self.conn.clone();
        let info: String = redis::cmd("INFO").query_async(&mut conn).await?;
        Ok(Stats::from([(self.addr.clone(), parse_info(&info))]))
    }

    /// Nothing to send: the socket closes when the owning cache drops this
    /// remote, which [`TieredCache::close`](crate::TieredCache::close) does
    /// right after calling `quit`.
    async fn quit(&self) -> Result<(), RemoteError> {
        debug!("redis: releasing connection to {}", self.addr);
        Ok(())
    }
}
