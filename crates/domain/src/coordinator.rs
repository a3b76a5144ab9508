use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancellation::CancellationQuery;
use crate::fingerprint::RequestIdentity;
use crate::keys::{KeySpace, RecordKeys, cancelled_key, progress_key};
use crate::ports::kv::{KvError, KvStore, SetOptions};
use crate::priority::{PriorityTable, is_coordinated};
use crate::streaming::{StreamingConfig, StreamingCoordinator};
use crate::util::{AdaptiveBackoff, now_ms};

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Safety-net TTL shared by every execution record key.
    pub record_ttl: Duration,
    /// How long a stored result stays readable for registered waiters.
    pub result_ttl: Duration,
    /// Lifetime of the `completed` marker when nobody was waiting.
    pub unwaited_status_ttl: Duration,
    /// Ceiling for every wait loop; must stay below `record_ttl`.
    pub max_wait: Duration,
    pub poll_initial: Duration,
    pub poll_max: Duration,
    pub poll_factor: f64,
    pub multiple_request_check: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(130),
            result_ttl: Duration::from_secs(10),
            unwaited_status_ttl: Duration::from_secs(2),
            max_wait: Duration::from_secs(125),
            poll_initial: Duration::from_millis(500),
            poll_max: Duration::from_secs(2),
            poll_factor: 1.5,
            multiple_request_check: Duration::from_secs(2),
        }
    }
}

impl CoordinatorConfig {
    fn backoff(&self) -> AdaptiveBackoff {
        AdaptiveBackoff::new(self.poll_initial, self.poll_max, self.poll_factor)
    }
}

/// Outcome of waiting behind a higher priority request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    Ready,
    Cancelled,
    Timeout,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DedupStatus {
    InProgress,
    Completed,
    Error,
}

impl DedupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl FromStr for DedupStatus {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            _ => Err("unknown dedup status"),
        }
    }
}

/// The per-user pointer to the fingerprint that owns the execution slot.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveRequestPointer {
    pub request_key: String,
    #[serde(default)]
    pub priority: i32,
    pub path: String,
    /// Epoch milliseconds.
    pub started_at: i64,
    #[serde(default)]
    pub request_number: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoredResponse {
    pub body: serde_json::Value,
    pub status_code: u16,
}

/// Proof that this call incremented the user's active-request count. Only
/// the holder can decrement it, and redeeming consumes the ticket.
#[derive(Debug, PartialEq, Eq)]
pub struct RequestTicket {
    token: String,
    number: u64,
}

impl RequestTicket {
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Builds coordinators that share one store handle, key layout and priority
/// table.
#[derive(Clone)]
pub struct CoordinationService {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    priorities: Arc<PriorityTable>,
    config: CoordinatorConfig,
    streaming: StreamingConfig,
}

impl CoordinationService {
    pub fn new(
        store: Arc<dyn KvStore>,
        priorities: PriorityTable,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            keys: KeySpace::default(),
            priorities: Arc::new(priorities),
            config,
            streaming: StreamingConfig::default(),
        }
    }

    pub fn with_keyspace(mut self, keys: KeySpace) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_streaming_config(mut self, streaming: StreamingConfig) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn priorities(&self) -> &PriorityTable {
        &self.priorities
    }

    pub fn store(&self) -> Arc<dyn KvStore> {
        self.store.clone()
    }

    pub fn request(&self, identity: RequestIdentity) -> RequestCoordinator {
        RequestCoordinator::new(
            self.store.clone(),
            self.keys.clone(),
            &self.priorities,
            self.config.clone(),
            identity,
        )
    }

    pub fn streaming(&self, identity: RequestIdentity) -> StreamingCoordinator {
        StreamingCoordinator::new(self.request(identity), self.streaming.clone())
    }

    pub fn cancellation(&self) -> CancellationQuery {
        CancellationQuery::new(self.store.clone(), self.keys.clone(), self.config.record_ttl)
    }
}

/// Coordinates one inbound call against every other call for the same user.
///
/// The caller claims, then either executes and stores the response, or waits
/// for a duplicate's result or for a higher priority request to finish. All
/// public operations fail open on store errors: they log and return the
/// value that lets the caller proceed uncoordinated.
pub struct RequestCoordinator {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    config: CoordinatorConfig,
    identity: RequestIdentity,
    request_key: String,
    record: RecordKeys,
    priority: i32,
    legacy_last_one_wins: bool,
    ticket: Option<RequestTicket>,
    multiple_requests: bool,
}

impl RequestCoordinator {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: KeySpace,
        priorities: &PriorityTable,
        config: CoordinatorConfig,
        identity: RequestIdentity,
    ) -> Self {
        let request_key = identity.request_key(&keys);
        let record = RecordKeys::for_request(&request_key);
        Self {
            store,
            priority: priorities.priority(&identity.path),
            legacy_last_one_wins: priorities.is_legacy_last_one_wins(&identity.path),
            keys,
            config,
            identity,
            request_key,
            record,
            ticket: None,
            multiple_requests: false,
        }
    }

    pub fn request_key(&self) -> &str {
        &self.request_key
    }

    pub fn identity(&self) -> &RequestIdentity {
        &self.identity
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn request_number(&self) -> Option<u64> {
        self.ticket.as_ref().map(RequestTicket::number)
    }

    /// Whether another request for the same user was active the last time
    /// the active-request count was read.
    pub fn multiple_requests_detected(&self) -> bool {
        self.multiple_requests
    }

    pub fn should_deduplicate(&self) -> bool {
        is_coordinated(&self.identity.method, &self.identity.path)
    }

    pub(crate) fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub(crate) fn record(&self) -> &RecordKeys {
        &self.record
    }

    /// Returns `true` when this caller should execute the work.
    pub async fn claim_request(&mut self) -> bool {
        if !self.should_deduplicate() {
            return true;
        }
        self.assign_request_number().await;

        match self.try_claim().await {
            Ok(claimed) => claimed,
            Err(err) => {
                error!(
                    request_key = %self.request_key,
                    error = %err,
                    "claim failed; executing uncoordinated"
                );
                true
            }
        }
    }

    async fn try_claim(&mut self) -> Result<bool, KvError> {
        let active = self.read_active_request().await?;

        if let Some(active) = &active
            && active.path == self.identity.path
            && active.request_key != self.request_key
        {
            info!(
                user = %self.identity.user,
                path = %self.identity.path,
                previous = %active.request_key,
                request_key = %self.request_key,
                "newer same-endpoint request replaces previous one"
            );
            self.cancel_request(&active.request_key).await?;
            self.force_claim().await?;
            return Ok(true);
        }

        if self.legacy_last_one_wins {
            if let Some(active) = &active
                && active.path == self.identity.path
                && active.request_key != self.request_key
            {
                self.cancel_request(&active.request_key).await?;
            }
            self.force_claim().await?;
            return Ok(true);
        }

        if let Some(active) = &active
            && active.priority > self.priority
        {
            info!(
                request_key = %self.request_key,
                priority = self.priority,
                active_priority = active.priority,
                "higher priority request running; waiting"
            );
            return Ok(false);
        }

        let claimed = self
            .store
            .set(
                &self.record.progress,
                DedupStatus::InProgress.as_str(),
                SetOptions::if_absent_with_ttl(self.config.record_ttl),
            )
            .await?;
        if !claimed {
            info!(
                request_key = %self.request_key,
                "identical request already in progress; will wait for its result"
            );
            return Ok(false);
        }

        info!(
            user = %self.identity.user,
            request_key = %self.request_key,
            "claimed request"
        );
        self.clear_stale_markers().await?;
        self.cancel_lower_priority().await?;
        self.publish_active_request().await?;
        Ok(true)
    }

    /// Unconditional claim used by last-one-wins.
    async fn force_claim(&mut self) -> Result<(), KvError> {
        self.store
            .set(
                &self.record.progress,
                DedupStatus::InProgress.as_str(),
                SetOptions::with_ttl(self.config.record_ttl),
            )
            .await?;
        self.clear_stale_markers().await?;
        self.publish_active_request().await
    }

    /// A reused fingerprint starts without the previous execution's markers.
    async fn clear_stale_markers(&self) -> Result<(), KvError> {
        self.store
            .delete(&[
                self.record.status.clone(),
                self.record.result.clone(),
                self.record.cancelled.clone(),
            ])
            .await?;
        Ok(())
    }

    /// Marks `request_key` cancelled and drops its progress key so it no
    /// longer satisfies dedup checks.
    pub(crate) async fn cancel_request(&self, request_key: &str) -> Result<(), KvError> {
        self.store
            .set(
                &cancelled_key(request_key),
                "1",
                SetOptions::with_ttl(self.config.record_ttl),
            )
            .await?;
        self.store.delete(&[progress_key(request_key)]).await?;
        Ok(())
    }

    pub(crate) async fn cancel_lower_priority(&self) -> Result<bool, KvError> {
        let Some(active) = self.read_active_request().await? else {
            return Ok(false);
        };
        if self.priority <= active.priority || active.request_key == self.request_key {
            return Ok(false);
        }
        info!(
            user = %self.identity.user,
            cancelled = %active.request_key,
            cancelled_priority = active.priority,
            path = %self.identity.path,
            priority = self.priority,
            "cancelling lower priority request"
        );
        self.cancel_request(&active.request_key).await?;
        Ok(true)
    }

    /// Cancels the user's active request when it has a lower priority than
    /// this one. Returns whether a request was cancelled.
    pub async fn preempt_lower_priority(&self) -> bool {
        match self.cancel_lower_priority().await {
            Ok(cancelled) => cancelled,
            Err(err) => {
                error!(request_key = %self.request_key, error = %err, "preemption check failed");
                false
            }
        }
    }

    pub async fn should_wait_for_higher_priority(&self) -> bool {
        match self.read_active_request().await {
            Ok(Some(active)) => active.priority > self.priority,
            Ok(None) => false,
            Err(err) => {
                error!(error = %err, "failed to check for higher priority requests");
                false
            }
        }
    }

    pub(crate) async fn read_active_request(
        &self,
    ) -> Result<Option<ActiveRequestPointer>, KvError> {
        read_active_request(self.store.as_ref(), &self.keys, &self.identity.user).await
    }

    pub(crate) async fn publish_active_request(&self) -> Result<(), KvError> {
        let pointer = ActiveRequestPointer {
            request_key: self.request_key.clone(),
            priority: self.priority,
            path: self.identity.path.clone(),
            started_at: now_ms(),
            request_number: self.request_number(),
        };
        let payload = serde_json::to_string(&pointer)
            .map_err(|err| KvError::Serialization(err.to_string()))?;
        self.store
            .set(
                &self.keys.active_request(&self.identity.user),
                &payload,
                SetOptions::with_ttl(self.config.record_ttl),
            )
            .await?;
        Ok(())
    }

    /// Deletes the user's active pointer only while it still names this
    /// fingerprint, so a newer owner is never clobbered.
    pub(crate) async fn clear_active_request(&self) {
        let outcome = async {
            if let Some(active) = self.read_active_request().await?
                && active.request_key == self.request_key
            {
                self.store
                    .delete(&[self.keys.active_request(&self.identity.user)])
                    .await?;
            }
            Ok::<_, KvError>(())
        }
        .await;
        if let Err(err) = outcome {
            error!(request_key = %self.request_key, error = %err, "failed to clear active request");
        }
    }

    /// Waits for the executor of the identical request and returns its
    /// response. `None` means error, timeout or a result that is no longer
    /// available; the caller decides whether to execute standalone.
    pub async fn wait_for_deduplicated_response(&mut self) -> Option<StoredResponse> {
        if !self.should_deduplicate() {
            return None;
        }
        if let Err(err) = self.register_waiter().await {
            warn!(request_key = %self.request_key, error = %err, "failed to register waiter");
        }

        let started = Instant::now();
        let deadline = started + self.config.max_wait;
        let mut last_count_check = started;
        let mut backoff = self.config.backoff();

        while Instant::now() < deadline {
            match self.read_status().await {
                Ok(Some(DedupStatus::Completed)) => {
                    let response = match self.read_result().await {
                        Ok(response) => response,
                        Err(err) => {
                            warn!(request_key = %self.request_key, error = %err, "stored result unreadable");
                            None
                        }
                    };
                    self.cleanup_if_last_waiter().await;
                    match response {
                        Some(response) => {
                            info!(request_key = %self.request_key, "retrieved deduplicated response");
                            self.release_request_number().await;
                            return Some(response);
                        }
                        None => {
                            warn!(
                                request_key = %self.request_key,
                                "request completed without a retained result"
                            );
                            return None;
                        }
                    }
                }
                Ok(Some(DedupStatus::Error)) => {
                    warn!(request_key = %self.request_key, "original request failed");
                    self.cleanup_if_last_waiter().await;
                    return None;
                }
                Ok(_) => {}
                Err(err) => {
                    error!(request_key = %self.request_key, error = %err, "error polling for deduplicated response");
                }
            }

            let now = Instant::now();
            if now.duration_since(last_count_check) >= self.config.multiple_request_check {
                last_count_check = now;
                self.refresh_multiple_requests().await;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(backoff.next_delay().min(remaining)).await;
        }

        warn!(request_key = %self.request_key, "timed out waiting for deduplicated response");
        self.cleanup_if_last_waiter().await;
        None
    }

    async fn register_waiter(&self) -> Result<(), KvError> {
        self.store.incr(&self.record.waiters).await?;
        self.store
            .expire(&self.record.waiters, self.config.record_ttl)
            .await?;
        Ok(())
    }

    async fn read_status(&self) -> Result<Option<DedupStatus>, KvError> {
        let status = self.store.get(&self.record.status).await?;
        Ok(status.and_then(|value| value.parse().ok()))
    }

    async fn read_result(&self) -> Result<Option<StoredResponse>, KvError> {
        let Some(payload) = self.store.get(&self.record.result).await? else {
            return Ok(None);
        };
        serde_json::from_str(&payload)
            .map(Some)
            .map_err(|err| KvError::Serialization(err.to_string()))
    }

    /// Decrements the waiter count; the caller that observes zero removes the
    /// whole execution record.
    async fn cleanup_if_last_waiter(&self) {
        let outcome = async {
            let remaining = self.store.decr(&self.record.waiters).await?;
            if remaining <= 0 {
                self.store.delete(&self.record.execution_record()).await?;
                debug!(request_key = %self.request_key, "last waiter removed execution record");
            }
            Ok::<_, KvError>(())
        }
        .await;
        if let Err(err) = outcome {
            error!(request_key = %self.request_key, error = %err, "waiter cleanup failed");
        }
    }

    /// Polls until no higher priority request owns the user's slot.
    pub async fn wait_for_higher_priority_completion(&self) -> WaitResult {
        let deadline = Instant::now() + self.config.max_wait;
        let mut backoff = self.config.backoff();

        while Instant::now() < deadline {
            match self.higher_priority_state().await {
                Ok(Some(result)) => return result,
                Ok(None) => {}
                Err(err) => {
                    error!(request_key = %self.request_key, error = %err, "error waiting for higher priority request");
                    return WaitResult::Error;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(backoff.next_delay().min(remaining)).await;
        }

        warn!(request_key = %self.request_key, "timed out waiting for higher priority request");
        WaitResult::Timeout
    }

    async fn higher_priority_state(&self) -> Result<Option<WaitResult>, KvError> {
        if self.store.get(&self.record.cancelled).await?.is_some() {
            info!(request_key = %self.request_key, "cancelled while waiting");
            return Ok(Some(WaitResult::Cancelled));
        }
        match self.read_active_request().await? {
            None => Ok(Some(WaitResult::Ready)),
            Some(active) if active.priority <= self.priority => Ok(Some(WaitResult::Ready)),
            Some(active) => {
                debug!(
                    request_key = %self.request_key,
                    active_priority = active.priority,
                    "still waiting for higher priority request"
                );
                Ok(None)
            }
        }
    }

    /// Publishes the executor's response for any waiters, then releases the
    /// user's execution slot and request number.
    pub async fn store_response(&mut self, body: serde_json::Value, status_code: u16) {
        if !self.should_deduplicate() {
            return;
        }
        if let Err(err) = self.publish_response(body, status_code).await {
            error!(request_key = %self.request_key, error = %err, "failed to store response");
            self.write_error_status().await;
        }
        self.clear_active_request().await;
        self.release_request_number().await;
    }

    async fn publish_response(
        &self,
        body: serde_json::Value,
        status_code: u16,
    ) -> Result<(), KvError> {
        let waiters = self
            .store
            .get(&self.record.waiters)
            .await?
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0);

        if waiters > 0 {
            let payload = serde_json::to_string(&StoredResponse { body, status_code })
                .map_err(|err| KvError::Serialization(err.to_string()))?;
            let ttl = SetOptions::with_ttl(self.config.result_ttl);
            self.store.set(&self.record.result, &payload, ttl).await?;
            self.store
                .set(&self.record.status, DedupStatus::Completed.as_str(), ttl)
                .await?;
            info!(
                request_key = %self.request_key,
                waiters,
                ttl_secs = self.config.result_ttl.as_secs(),
                "stored response for waiters"
            );
        } else {
            self.store
                .set(
                    &self.record.status,
                    DedupStatus::Completed.as_str(),
                    SetOptions::with_ttl(self.config.unwaited_status_ttl),
                )
                .await?;
            self.store
                .delete(&[
                    self.record.progress.clone(),
                    self.record.cancelled.clone(),
                    self.record.result.clone(),
                    self.record.request_number.clone(),
                ])
                .await?;
            info!(request_key = %self.request_key, "no waiters; execution record released");
        }
        Ok(())
    }

    /// Failure path for the executor: waiters observe `error` and fall back.
    pub async fn mark_error(&mut self) {
        if !self.should_deduplicate() {
            return;
        }
        self.write_error_status().await;
        self.clear_active_request().await;
        self.release_request_number().await;
    }

    /// Executor stopped without a verdict, e.g. a lost driver session. The
    /// record stays open for waiters and a retry of the same request can
    /// claim it again.
    pub async fn abandon(&mut self) {
        if !self.should_deduplicate() {
            return;
        }
        if let Err(err) = self.store.delete(&[self.record.progress.clone()]).await {
            error!(request_key = %self.request_key, error = %err, "failed to release claim");
        }
        info!(request_key = %self.request_key, "abandoned claim for retry");
        self.clear_active_request().await;
        self.release_request_number().await;
    }

    async fn write_error_status(&self) {
        if let Err(err) = self
            .store
            .set(
                &self.record.status,
                DedupStatus::Error.as_str(),
                SetOptions::with_ttl(self.config.record_ttl),
            )
            .await
        {
            error!(request_key = %self.request_key, error = %err, "failed to mark request as failed");
        }
    }

    pub async fn is_cancelled(&self) -> bool {
        match self.store.get(&self.record.cancelled).await {
            Ok(value) => value.is_some(),
            Err(err) => {
                error!(request_key = %self.request_key, error = %err, "failed to check cancellation");
                false
            }
        }
    }

    pub async fn is_duplicate_in_progress(&self) -> bool {
        match self.store.get(&self.record.progress).await {
            Ok(value) => value.is_some(),
            Err(err) => {
                error!(request_key = %self.request_key, error = %err, "failed to check duplicate status");
                false
            }
        }
    }

    /// Assigns this call's request number, reusing the fingerprint's number
    /// when one exists, and counts the call as active for the user.
    pub async fn assign_request_number(&mut self) -> Option<u64> {
        if let Some(ticket) = &self.ticket {
            return Some(ticket.number);
        }
        match self.issue_ticket().await {
            Ok(ticket) => {
                let number = ticket.number;
                self.ticket = Some(ticket);
                Some(number)
            }
            Err(err) => {
                error!(request_key = %self.request_key, error = %err, "failed to assign request number");
                None
            }
        }
    }

    async fn issue_ticket(&mut self) -> Result<RequestTicket, KvError> {
        let user = &self.identity.user;
        let ttl = self.config.record_ttl;
        let existing = self
            .store
            .get(&self.record.request_number)
            .await?
            .and_then(|value| value.parse::<u64>().ok());

        let number = match existing {
            Some(number) => number,
            None => {
                let counter = self.keys.request_counter(user);
                let candidate = self.store.incr(&counter).await?.max(1) as u64;
                self.store.expire(&counter, ttl).await?;
                let stored = self
                    .store
                    .set(
                        &self.record.request_number,
                        &candidate.to_string(),
                        SetOptions::if_absent_with_ttl(ttl),
                    )
                    .await?;
                if stored {
                    candidate
                } else {
                    self.store
                        .get(&self.record.request_number)
                        .await?
                        .and_then(|value| value.parse::<u64>().ok())
                        .unwrap_or(candidate)
                }
            }
        };

        let token = Uuid::new_v4().simple().to_string();
        self.store
            .set(
                &self.keys.ticket(user, &token),
                &number.to_string(),
                SetOptions::with_ttl(ttl),
            )
            .await?;
        let count_key = self.keys.active_request_count(user);
        let active = self.store.incr(&count_key).await?;
        self.store.expire(&count_key, ttl).await?;
        self.multiple_requests = active > 1;
        debug!(
            user = %user,
            request_key = %self.request_key,
            request_number = number,
            active,
            "assigned request number"
        );
        Ok(RequestTicket { token, number })
    }

    /// Releases this call's request number. Safe to call from every exit
    /// path: the ticket is consumed on first use.
    pub async fn release_request_number(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.release_ticket(ticket).await;
        }
    }

    /// Hands the ticket to the caller, who then owns its release through
    /// [`Self::release_ticket`].
    pub fn take_ticket(&mut self) -> Option<RequestTicket> {
        self.ticket.take()
    }

    /// Consumes `ticket`, decrementing the user's active count once.
    pub async fn release_ticket(&self, ticket: RequestTicket) {
        if let Err(err) = self.redeem_ticket(ticket).await {
            error!(request_key = %self.request_key, error = %err, "failed to release request number");
        }
    }

    async fn redeem_ticket(&self, ticket: RequestTicket) -> Result<(), KvError> {
        let user = &self.identity.user;
        let removed = self
            .store
            .delete(&[self.keys.ticket(user, &ticket.token)])
            .await?;
        if removed == 0 {
            return Ok(());
        }
        let count_key = self.keys.active_request_count(user);
        let remaining = self.store.decr(&count_key).await?;
        if remaining <= 0 {
            self.store
                .delete(&[count_key, self.keys.request_counter(user)])
                .await?;
            debug!(user = %user, "no active requests left; request counter reset");
        }
        Ok(())
    }

    /// Reads the user's active-request count.
    pub async fn has_multiple_requests(&self) -> bool {
        match self
            .store
            .get(&self.keys.active_request_count(&self.identity.user))
            .await
        {
            Ok(value) => value.and_then(|count| count.parse::<i64>().ok()).unwrap_or(0) > 1,
            Err(err) => {
                warn!(error = %err, "failed to read active request count");
                false
            }
        }
    }

    async fn refresh_multiple_requests(&mut self) {
        if self.has_multiple_requests().await {
            self.multiple_requests = true;
        }
    }
}

pub(crate) async fn read_active_request(
    store: &dyn KvStore,
    keys: &KeySpace,
    user: &str,
) -> Result<Option<ActiveRequestPointer>, KvError> {
    let Some(payload) = store.get(&keys.active_request(user)).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&payload) {
        Ok(pointer) => Ok(Some(pointer)),
        Err(err) => {
            warn!(user = %user, error = %err, "ignoring malformed active request pointer");
            Ok(None)
        }
    }
}
