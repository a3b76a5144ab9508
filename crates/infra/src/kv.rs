use std::sync::Arc;
use std::time::Duration;

use kindling_domain::ports::BoxFuture;
use kindling_domain::ports::kv::{KvError, KvStore, SetOptions};
use std::fmt::Display;

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Cmd, FromRedisValue, RedisError};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout};
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct ConnectionPolicy {
    /// Minimum gap between two reconnect attempts.
    pub reconnect_cooldown: Duration,
    /// Consecutive failed attempts before the adapter stops reconnecting.
    pub max_reconnect_failures: u32,
    /// How long reconnects stay suspended once the failure limit is hit.
    pub circuit_open: Duration,
    pub connect_attempts: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
    /// Bound on one connect attempt, handshake and PING included.
    pub connect_timeout: Duration,
    /// Bound on one command round trip.
    pub command_timeout: Duration,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            reconnect_cooldown: Duration::from_secs(1),
            max_reconnect_failures: 10,
            circuit_open: Duration::from_secs(30),
            connect_attempts: 3,
            retry_backoff_base: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Default)]
struct ConnectionState {
    manager: Option<ConnectionManager>,
    consecutive_failures: u32,
    last_attempt: Option<Instant>,
    open_until: Option<Instant>,
    /// Set while a connect runs outside the lock; other callers fail fast
    /// until it finishes or the deadline passes.
    connecting_until: Option<Instant>,
}

/// Redis-backed [`KvStore`]. The connection is opened lazily on first use
/// and re-opened after transport errors, subject to the reconnect circuit.
#[derive(Clone)]
pub struct RedisKvStore {
    client: redis::Client,
    policy: ConnectionPolicy,
    state: Arc<Mutex<ConnectionState>>,
}

impl RedisKvStore {
    /// Accepts `redis://` and `rediss://` (TLS) URLs. Does not connect.
    pub fn new(redis_url: &str, policy: ConnectionPolicy) -> Result<Self, KvError> {
        let client =
            redis::Client::open(redis_url).map_err(|err| KvError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            policy,
            state: Arc::new(Mutex::new(ConnectionState::default())),
        })
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.manager.is_some()
    }

    async fn connection(&self) -> Result<ConnectionManager, KvError> {
        {
            let mut state = self.state.lock().await;
            if let Some(manager) = &state.manager {
                return Ok(manager.clone());
            }
            let now = Instant::now();
            check_connecting(&state, now)?;
            check_circuit(&mut state, &self.policy, now)?;
            state.last_attempt = Some(now);
            state.connecting_until = Some(now + connect_budget(&self.policy));
        }

        let opened = self.open_connection().await;

        let mut state = self.state.lock().await;
        state.connecting_until = None;
        match opened {
            Ok(manager) => {
                info!(
                    previous_failures = state.consecutive_failures,
                    "connected to redis"
                );
                state.consecutive_failures = 0;
                state.manager = Some(manager.clone());
                Ok(manager)
            }
            Err(err) => {
                record_failure(&mut state, &self.policy, Instant::now());
                Err(err)
            }
        }
    }

    async fn open_connection(&self) -> Result<ConnectionManager, KvError> {
        let attempts = self.policy.connect_attempts.max(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            match self.try_open().await {
                Ok(manager) => return Ok(manager),
                Err(err) => {
                    warn!(attempt, error = %err, "redis connection attempt failed");
                    last_error = Some(err);
                    if attempt + 1 < attempts {
                        sleep(backoff_for_attempt(
                            self.policy.retry_backoff_base,
                            self.policy.retry_backoff_max,
                            attempt,
                        ))
                        .await;
                    }
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| KvError::Unavailable("redis connection failed".to_string())))
    }

    async fn try_open(&self) -> Result<ConnectionManager, KvError> {
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(self.policy.connect_timeout)
            .set_response_timeout(self.policy.command_timeout);
        let open = async {
            let mut manager =
                ConnectionManager::new_with_config(self.client.clone(), config).await?;
            let _: String = redis::cmd("PING").query_async(&mut manager).await?;
            Ok::<_, RedisError>(manager)
        };
        match timeout(self.policy.connect_timeout, open).await {
            Ok(Ok(manager)) => Ok(manager),
            Ok(Err(err)) => Err(KvError::Unavailable(err.to_string())),
            Err(_) => Err(KvError::Unavailable(format!(
                "redis did not answer within {} ms",
                self.policy.connect_timeout.as_millis()
            ))),
        }
    }

    async fn drop_connection(&self, reason: impl Display) {
        let mut state = self.state.lock().await;
        if state.manager.take().is_some() {
            warn!(error = %reason, "redis connection lost; will reconnect");
            record_failure(&mut state, &self.policy, Instant::now());
        }
    }

    async fn query<T: FromRedisValue>(&self, cmd: Cmd) -> Result<T, KvError> {
        let mut conn = self.connection().await?;
        match timeout(self.policy.command_timeout, cmd.query_async(&mut conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) if is_transport_error(&err) => {
                self.drop_connection(&err).await;
                Err(KvError::Unavailable(err.to_string()))
            }
            Ok(Err(err)) => Err(KvError::Operation(err.to_string())),
            Err(_) => {
                let message = format!(
                    "redis command timed out after {} ms",
                    self.policy.command_timeout.as_millis()
                );
                self.drop_connection(&message).await;
                Err(KvError::Unavailable(message))
            }
        }
    }
}

impl KvStore for RedisKvStore {
    fn set(
        &self,
        key: &str,
        value: &str,
        options: SetOptions,
    ) -> BoxFuture<'_, Result<bool, KvError>> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if options.only_if_absent {
            cmd.arg("NX");
        }
        if let Some(ttl) = options.ttl {
            cmd.arg("PX").arg(ttl_ms(ttl));
        }
        Box::pin(async move {
            let reply: Option<String> = self.query(cmd).await?;
            Ok(reply.is_some())
        })
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, KvError>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        Box::pin(async move { self.query(cmd).await })
    }

    fn delete(&self, keys: &[String]) -> BoxFuture<'_, Result<u64, KvError>> {
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        let empty = keys.is_empty();
        Box::pin(async move {
            if empty {
                return Ok(0);
            }
            self.query(cmd).await
        })
    }

    fn incr(&self, key: &str) -> BoxFuture<'_, Result<i64, KvError>> {
        let mut cmd = redis::cmd("INCR");
        cmd.arg(key);
        Box::pin(async move { self.query(cmd).await })
    }

    fn decr(&self, key: &str) -> BoxFuture<'_, Result<i64, KvError>> {
        let mut cmd = redis::cmd("DECR");
        cmd.arg(key);
        Box::pin(async move { self.query(cmd).await })
    }

    fn expire(&self, key: &str, ttl: Duration) -> BoxFuture<'_, Result<bool, KvError>> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(ttl_ms(ttl));
        Box::pin(async move { self.query(cmd).await })
    }

    fn rpush(&self, key: &str, value: &str) -> BoxFuture<'_, Result<u64, KvError>> {
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(key).arg(value);
        Box::pin(async move { self.query(cmd).await })
    }

    fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> BoxFuture<'_, Result<Vec<String>, KvError>> {
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(start).arg(stop);
        Box::pin(async move { self.query(cmd).await })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), KvError>> {
        Box::pin(async move {
            let _: String = self.query(redis::cmd("PING")).await?;
            Ok(())
        })
    }
}

fn check_circuit(
    state: &mut ConnectionState,
    policy: &ConnectionPolicy,
    now: Instant,
) -> Result<(), KvError> {
    if let Some(open_until) = state.open_until {
        if now < open_until {
            return Err(KvError::Unavailable(
                "redis reconnect circuit is open".to_string(),
            ));
        }
        state.open_until = None;
        state.consecutive_failures = 0;
        state.last_attempt = None;
    }
    if let Some(last_attempt) = state.last_attempt
        && now.duration_since(last_attempt) < policy.reconnect_cooldown
    {
        return Err(KvError::Unavailable(
            "redis reconnect attempted too recently".to_string(),
        ));
    }
    Ok(())
}

fn check_connecting(state: &ConnectionState, now: Instant) -> Result<(), KvError> {
    match state.connecting_until {
        Some(deadline) if now < deadline => Err(KvError::Unavailable(
            "redis connection attempt in progress".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Worst case duration of one `open_connection` run.
fn connect_budget(policy: &ConnectionPolicy) -> Duration {
    let attempts = policy.connect_attempts.max(1);
    let backoff: Duration = (0..attempts.saturating_sub(1))
        .map(|attempt| {
            backoff_for_attempt(policy.retry_backoff_base, policy.retry_backoff_max, attempt)
        })
        .sum();
    policy.connect_timeout * attempts + backoff
}

fn record_failure(state: &mut ConnectionState, policy: &ConnectionPolicy, now: Instant) {
    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
    if state.consecutive_failures >= policy.max_reconnect_failures {
        state.open_until = Some(now + policy.circuit_open);
        warn!(
            failures = state.consecutive_failures,
            open_for_ms = policy.circuit_open.as_millis() as u64,
            "giving up on redis reconnects for now"
        );
    }
}

fn is_transport_error(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

fn ttl_ms(ttl: Duration) -> u64 {
    let ms = ttl.as_millis() as u64;
    if ms == 0 { 1 } else { ms }
}

fn backoff_for_attempt(base: Duration, max: Duration, attempt: u32) -> Duration {
    if base.is_zero() {
        return Duration::from_millis(1);
    }
    let multiplier = 1u64 << attempt.min(8);
    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    let delay_ms = base_ms.saturating_mul(multiplier).max(1);
    if max_ms == 0 {
        Duration::from_millis(delay_ms)
    } else {
        Duration::from_millis(delay_ms.min(max_ms))
    }
}
