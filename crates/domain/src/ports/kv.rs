use std::time::Duration;
use thiserror::Error;

use super::BoxFuture;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),
    #[error("key-value store operation failed: {0}")]
    Operation(String),
    #[error("key-value serialization error: {0}")]
    Serialization(String),
}

/// Options for [`KvStore::set`]. `only_if_absent` maps to `NX`; a `ttl` of
/// `None` stores the key without expiry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub only_if_absent: bool,
    pub ttl: Option<Duration>,
}

impl SetOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            only_if_absent: false,
            ttl: Some(ttl),
        }
    }

    pub fn if_absent_with_ttl(ttl: Duration) -> Self {
        Self {
            only_if_absent: true,
            ttl: Some(ttl),
        }
    }
}

/// The coordination substrate. Every call is a single round-trip; the only
/// atomic check-and-set is `set` with `only_if_absent`.
pub trait KvStore: Send + Sync {
    /// Returns `false` only when `only_if_absent` was requested and the key
    /// already existed.
    fn set(&self, key: &str, value: &str, options: SetOptions)
    -> BoxFuture<'_, Result<bool, KvError>>;
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, KvError>>;
    /// Returns the number of keys that existed and were removed.
    fn delete(&self, keys: &[String]) -> BoxFuture<'_, Result<u64, KvError>>;
    fn incr(&self, key: &str) -> BoxFuture<'_, Result<i64, KvError>>;
    fn decr(&self, key: &str) -> BoxFuture<'_, Result<i64, KvError>>;
    fn expire(&self, key: &str, ttl: Duration) -> BoxFuture<'_, Result<bool, KvError>>;
    fn rpush(&self, key: &str, value: &str) -> BoxFuture<'_, Result<u64, KvError>>;
    /// Inclusive range with Redis index semantics (`-1` is the last element).
    fn lrange(&self, key: &str, start: i64, stop: i64)
    -> BoxFuture<'_, Result<Vec<String>, KvError>>;
    fn ping(&self) -> BoxFuture<'_, Result<(), KvError>>;
}
