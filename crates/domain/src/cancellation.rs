use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::coordinator::{ActiveRequestPointer, read_active_request};
use crate::keys::{KeySpace, cancelled_key};
use crate::ports::kv::{KvError, KvStore, SetOptions};

pub const DEFAULT_CHECK_INTERVAL: u32 = 5;

/// Cancellation flags for code that does not hold a coordinator, such as
/// deep automation loops. Never blocks and never fails: store trouble reads
/// as "not cancelled".
#[derive(Clone)]
pub struct CancellationQuery {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    cancel_ttl: Duration,
}

impl CancellationQuery {
    pub fn new(store: Arc<dyn KvStore>, keys: KeySpace, cancel_ttl: Duration) -> Self {
        Self {
            store,
            keys,
            cancel_ttl,
        }
    }

    pub async fn active_request_info(&self, user: &str) -> Option<ActiveRequestPointer> {
        match read_active_request(self.store.as_ref(), &self.keys, user).await {
            Ok(pointer) => pointer,
            Err(err) => {
                error!(user = %user, error = %err, "failed to read active request");
                None
            }
        }
    }

    async fn resolve_request_key(
        &self,
        user: &str,
        request_key: Option<&str>,
    ) -> Result<Option<String>, KvError> {
        if let Some(request_key) = request_key {
            return Ok(Some(request_key.to_string()));
        }
        let pointer = read_active_request(self.store.as_ref(), &self.keys, user).await?;
        Ok(pointer.map(|pointer| pointer.request_key))
    }

    /// Whether `request_key` (or the user's active request) was asked to stop.
    pub async fn should_cancel(&self, user: &str, request_key: Option<&str>) -> bool {
        let outcome = async {
            let Some(request_key) = self.resolve_request_key(user, request_key).await? else {
                debug!(user = %user, "no request to check for cancellation");
                return Ok(false);
            };
            let cancelled = self.store.get(&cancelled_key(&request_key)).await?.is_some();
            if cancelled {
                info!(user = %user, request_key = %request_key, "cancellation detected");
            }
            Ok::<_, KvError>(cancelled)
        }
        .await;
        outcome.unwrap_or_else(|err| {
            error!(user = %user, error = %err, "failed to check cancellation");
            false
        })
    }

    /// Flags `request_key` (or the user's active request) as cancelled.
    /// Returns whether a flag was written.
    pub async fn mark_cancelled(&self, user: &str, request_key: Option<&str>) -> bool {
        let outcome = async {
            let Some(request_key) = self.resolve_request_key(user, request_key).await? else {
                warn!(user = %user, "no active request to cancel");
                return Ok(false);
            };
            self.store
                .set(
                    &cancelled_key(&request_key),
                    "1",
                    SetOptions::with_ttl(self.cancel_ttl),
                )
                .await?;
            info!(user = %user, request_key = %request_key, "marked request cancelled");
            Ok::<_, KvError>(true)
        }
        .await;
        outcome.unwrap_or_else(|err| {
            error!(user = %user, error = %err, "failed to mark request cancelled");
            false
        })
    }

    /// A checker bound to the user's current active request.
    pub async fn checker(&self, user: &str, interval: u32) -> CancellationChecker {
        let request_key = self
            .active_request_info(user)
            .await
            .map(|pointer| pointer.request_key);
        CancellationChecker {
            query: Some(self.clone()),
            user: user.to_string(),
            request_key,
            interval: interval.max(1),
            calls: 0,
        }
    }

    /// A checker bound to a known request key.
    pub fn checker_for(
        &self,
        user: &str,
        request_key: impl Into<String>,
        interval: u32,
    ) -> CancellationChecker {
        CancellationChecker {
            query: Some(self.clone()),
            user: user.to_string(),
            request_key: Some(request_key.into()),
            interval: interval.max(1),
            calls: 0,
        }
    }
}

/// Amortised cancellation polling for tight loops: only every `interval`-th
/// call reaches the store; the others report "not cancelled".
#[derive(Clone)]
pub struct CancellationChecker {
    query: Option<CancellationQuery>,
    user: String,
    request_key: Option<String>,
    interval: u32,
    calls: u32,
}

impl CancellationChecker {
    /// For uncoordinated work: never reports cancellation.
    pub fn never() -> Self {
        Self {
            query: None,
            user: String::new(),
            request_key: None,
            interval: DEFAULT_CHECK_INTERVAL,
            calls: 0,
        }
    }

    pub fn request_key(&self) -> Option<&str> {
        self.request_key.as_deref()
    }

    pub async fn check(&mut self) -> bool {
        self.calls = self.calls.wrapping_add(1);
        if self.calls % self.interval != 0 {
            return false;
        }
        match &self.query {
            Some(query) => {
                query
                    .should_cancel(&self.user, self.request_key.as_deref())
                    .await
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for CancellationChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationChecker")
            .field("user", &self.user)
            .field("request_key", &self.request_key)
            .field("interval", &self.interval)
            .field("calls", &self.calls)
            .finish()
    }
}
