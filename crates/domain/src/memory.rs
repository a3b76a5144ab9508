use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::ports::BoxFuture;
use crate::ports::kv::{KvError, KvStore, SetOptions};

/// Process-local [`KvStore`] with Redis-compatible semantics for the subset
/// of commands the coordinators use. Expiry is measured on tokio's clock so
/// paused-time tests observe TTLs deterministically.
#[derive(Clone, Debug, Default)]
pub struct InMemoryKvStore {
    inner: Arc<Mutex<HashMap<String, MemoryEntry>>>,
    offline: Arc<AtomicBool>,
}

#[derive(Clone, Debug)]
enum MemoryValue {
    Text(String),
    List(Vec<String>),
}

#[derive(Clone, Debug)]
struct MemoryEntry {
    value: MemoryValue,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if now >= deadline)
    }
}

type Entries = HashMap<String, MemoryEntry>;

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing the store: every command fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let mut guard = self.inner.lock().expect("kv store lock");
        live_entry(&mut guard, key).is_some()
    }

    /// Live keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let guard = self.inner.lock().expect("kv store lock");
        let mut keys: Vec<String> = guard
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remaining time to live, or `None` for missing or persistent keys.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("kv store lock");
        live_entry(&mut guard, key)
            .and_then(|entry| entry.expires_at)
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    fn run<T, F>(&self, op: F) -> BoxFuture<'_, Result<T, KvError>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Entries) -> Result<T, KvError> + Send + 'static,
    {
        let inner = self.inner.clone();
        let offline = self.offline.load(Ordering::SeqCst);
        Box::pin(async move {
            if offline {
                return Err(KvError::Unavailable("in-memory store offline".into()));
            }
            let mut guard = inner.lock().expect("kv store lock");
            op(&mut guard)
        })
    }
}

fn live_entry<'a>(entries: &'a mut Entries, key: &str) -> Option<&'a mut MemoryEntry> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn wrong_type(key: &str) -> KvError {
    KvError::Operation(format!("WRONGTYPE operation against key {key} holding the wrong kind of value"))
}

fn add_to_integer(entries: &mut Entries, key: &str, delta: i64) -> Result<i64, KvError> {
    let (current, expires_at) = match live_entry(entries, key) {
        Some(MemoryEntry {
            value: MemoryValue::Text(text),
            expires_at,
        }) => {
            let current = text.parse::<i64>().map_err(|_| {
                KvError::Operation(format!("value at {key} is not an integer"))
            })?;
            (current, *expires_at)
        }
        Some(_) => return Err(wrong_type(key)),
        None => (0, None),
    };
    let next = current.saturating_add(delta);
    entries.insert(
        key.to_string(),
        MemoryEntry {
            value: MemoryValue::Text(next.to_string()),
            expires_at,
        },
    );
    Ok(next)
}

fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

impl KvStore for InMemoryKvStore {
    fn set(
        &self,
        key: &str,
        value: &str,
        options: SetOptions,
    ) -> BoxFuture<'_, Result<bool, KvError>> {
        let key = key.to_string();
        let value = value.to_string();
        self.run(move |entries| {
            if options.only_if_absent && live_entry(entries, &key).is_some() {
                return Ok(false);
            }
            let expires_at = options.ttl.map(|ttl| Instant::now() + ttl);
            entries.insert(
                key,
                MemoryEntry {
                    value: MemoryValue::Text(value),
                    expires_at,
                },
            );
            Ok(true)
        })
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, KvError>> {
        let key = key.to_string();
        self.run(move |entries| match live_entry(entries, &key) {
            Some(MemoryEntry {
                value: MemoryValue::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(wrong_type(&key)),
            None => Ok(None),
        })
    }

    fn delete(&self, keys: &[String]) -> BoxFuture<'_, Result<u64, KvError>> {
        let keys = keys.to_vec();
        self.run(move |entries| {
            let mut removed = 0;
            for key in keys {
                if live_entry(entries, &key).is_some() {
                    entries.remove(&key);
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    fn incr(&self, key: &str) -> BoxFuture<'_, Result<i64, KvError>> {
        let key = key.to_string();
        self.run(move |entries| add_to_integer(entries, &key, 1))
    }

    fn decr(&self, key: &str) -> BoxFuture<'_, Result<i64, KvError>> {
        let key = key.to_string();
        self.run(move |entries| add_to_integer(entries, &key, -1))
    }

    fn expire(&self, key: &str, ttl: Duration) -> BoxFuture<'_, Result<bool, KvError>> {
        let key = key.to_string();
        self.run(move |entries| match live_entry(entries, &key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    fn rpush(&self, key: &str, value: &str) -> BoxFuture<'_, Result<u64, KvError>> {
        let key = key.to_string();
        let value = value.to_string();
        self.run(move |entries| match live_entry(entries, &key) {
            Some(MemoryEntry {
                value: MemoryValue::List(items),
                ..
            }) => {
                items.push(value);
                Ok(items.len() as u64)
            }
            Some(_) => Err(wrong_type(&key)),
            None => {
                entries.insert(
                    key,
                    MemoryEntry {
                        value: MemoryValue::List(vec![value]),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        })
    }

    fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> BoxFuture<'_, Result<Vec<String>, KvError>> {
        let key = key.to_string();
        self.run(move |entries| match live_entry(entries, &key) {
            Some(MemoryEntry {
                value: MemoryValue::List(items),
                ..
            }) => Ok(resolve_range(items.len(), start, stop)
                .map(|(from, to)| items[from..=to].to_vec())
                .unwrap_or_default()),
            Some(_) => Err(wrong_type(&key)),
            None => Ok(Vec::new()),
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), KvError>> {
        self.run(|_| Ok(()))
    }
}
