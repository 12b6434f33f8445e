//! Cache error types

use redis::RedisError;

/// Errors raised by a remote tier client
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("server {server} replied with status {status:#06x}: {message}")]
    Status {
        server: String,
        status: u16,
        message: String,
    },

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error("key is {0} bytes, longer than the 250 byte limit")]
    KeyTooLong(usize),

    #[error("value is not a decimal counter")]
    NonNumeric,

    #[error("counter delta {0} does not fit the backend's signed 64-bit range")]
    DeltaOutOfRange(u64),

    #[error("no remote servers configured")]
    NoServers,
}

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Remote tier error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Not found")]
    NotFound,

    #[error("Key already exists")]
    AlreadyExists,

    #[error("Cache has been closed")]
    Closed,
}

impl From<figment::Error> for CacheError {
    fn from(e: figment::Error) -> Self {
        CacheError::Config(Box::new(e))
    }
}
