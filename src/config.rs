//! Cache configuration

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Deserializer, Serialize};

use crate::CacheError;

/// Environment variable prefix read by [`CacheConfig::load`]
pub const ENV_PREFIX: &str = "OCACHE_";

/// Default remote TTL in seconds, used when a write passes expiration 0
pub const DEFAULT_TTL_SECS: u32 = 3600;

/// Which remote tier client to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    #[default]
    Memcached,
    Redis,
}

/// Configuration for the two-tier cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Remote tier protocol
    pub backend: RemoteKind,
    /// Remote endpoints as `host:port`. Redis uses the first entry.
    #[serde(deserialize_with = "deserialize_servers")]
    pub servers: Vec<String>,
    /// Tenant identifier, unset for single-tenant deployments
    #[serde(deserialize_with = "deserialize_tenant")]
    pub tenant: Option<String>,
    /// Remote TTL applied when a write passes expiration 0
    pub default_ttl_secs: u32,
    /// Upper bound on establishing a connection to one server
    pub connect_timeout_ms: u64,
    /// Upper bound on one request/response exchange
    pub io_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: RemoteKind::Memcached,
            servers: vec!["127.0.0.1:11211".to_owned()],
            tenant: None,
            default_ttl_secs: DEFAULT_TTL_SECS,
            connect_timeout_ms: 250,
            io_timeout_ms: 1000,
        }
    }
}

impl CacheConfig {
    /// Load configuration from defaults, an optional TOML file and
    /// `OCACHE_*` environment variables, later sources winning.
    pub fn load(path: Option<&Path>) -> Result<Self, CacheError> {
        let mut figment = Figment::new().merge(Serialized::defaults(CacheConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX)).extract()?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ServerList {
    List(Vec<String>),
    Joined(String),
}

fn deserialize_servers<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(match ServerList::deserialize(d)? {
        ServerList::List(v) => v,
        ServerList::Joined(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TenantId {
    Text(String),
    Number(i64),
}

fn deserialize_tenant<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<TenantId>::deserialize(d)?.map(|t| match t {
        TenantId::Text(s) => s,
        TenantId::Number(n) => n.to_string(),
    }))
}
