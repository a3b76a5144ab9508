use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tracing::{error, info};

use crate::coordinator::RequestCoordinator;
use crate::keys::RecordKeys;
use crate::ports::kv::{KvError, KvStore, SetOptions};

#[derive(Clone, Debug)]
pub struct StreamingConfig {
    /// TTL of the replay buffer and live flag, refreshed on every append.
    pub stream_ttl: Duration,
    /// How long the buffer survives after the producer ends.
    pub ended_grace: Duration,
    pub poll_interval: Duration,
    /// A follower gives up after this many consecutive empty polls.
    pub max_empty_polls: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            stream_ttl: Duration::from_secs(300),
            ended_grace: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            max_empty_polls: 10,
        }
    }
}

/// Request coordination for endpoints that emit results incrementally.
/// One producer appends chunks to a replay buffer; joiners replay the buffer
/// and then follow its tail until the producer ends.
pub struct StreamingCoordinator {
    inner: RequestCoordinator,
    config: StreamingConfig,
}

impl StreamingCoordinator {
    pub fn new(inner: RequestCoordinator, config: StreamingConfig) -> Self {
        Self { inner, config }
    }

    pub fn coordinator(&self) -> &RequestCoordinator {
        &self.inner
    }

    pub fn coordinator_mut(&mut self) -> &mut RequestCoordinator {
        &mut self.inner
    }

    pub fn request_key(&self) -> &str {
        self.inner.request_key()
    }

    fn record(&self) -> &RecordKeys {
        self.inner.record()
    }

    fn store(&self) -> Arc<dyn KvStore> {
        self.inner.store().clone()
    }

    /// Returns `true` when this caller is the producer, `false` when a live
    /// stream already exists and the caller should replay and follow it.
    pub async fn start_streaming(&mut self) -> bool {
        match self.try_start().await {
            Ok(producer) => producer,
            Err(err) => {
                error!(request_key = %self.request_key(), error = %err, "failed to start stream; producing uncoordinated");
                true
            }
        }
    }

    async fn try_start(&mut self) -> Result<bool, KvError> {
        let store = self.store();
        let record = self.record().clone();

        if store.get(&record.streaming).await?.is_some() {
            info!(request_key = %self.request_key(), "joining existing stream");
            return Ok(false);
        }
        let claimed = store
            .set(
                &record.streaming,
                "1",
                SetOptions::if_absent_with_ttl(self.config.stream_ttl),
            )
            .await?;
        if !claimed {
            info!(request_key = %self.request_key(), "stream started concurrently; joining");
            return Ok(false);
        }

        info!(request_key = %self.request_key(), "started new stream");
        store.delete(&[record.accumulated.clone()]).await?;
        self.inner.cancel_lower_priority().await?;
        self.inner.publish_active_request().await?;
        Ok(true)
    }

    /// Appends one chunk to the replay buffer.
    pub async fn accumulate_data<T: Serialize>(&self, chunk: &T) {
        let outcome = async {
            let payload = serde_json::to_string(chunk)
                .map_err(|err| KvError::Serialization(err.to_string()))?;
            let store = self.store();
            let record = self.record();
            store.rpush(&record.accumulated, &payload).await?;
            store
                .expire(&record.accumulated, self.config.stream_ttl)
                .await?;
            store.expire(&record.streaming, self.config.stream_ttl).await?;
            Ok::<_, KvError>(())
        }
        .await;
        if let Err(err) = outcome {
            error!(request_key = %self.request_key(), error = %err, "failed to accumulate stream data");
        }
    }

    /// Snapshot of everything accumulated so far, in order. Call again for a
    /// fresh snapshot.
    pub fn get_accumulated_data<T>(&self) -> BoxStream<'static, T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let store = self.store();
        let key = self.record().accumulated.clone();
        stream::once(async move {
            match store.lrange(&key, 0, -1).await {
                Ok(items) => items,
                Err(err) => {
                    error!(key = %key, error = %err, "failed to read accumulated stream data");
                    Vec::new()
                }
            }
        })
        .flat_map(|items| stream::iter(items.into_iter().filter_map(|raw| decode_chunk(&raw))))
        .boxed()
    }

    /// Decoded snapshot plus the raw buffer length. Pass the length to
    /// [`Self::follow_stream`]: undecodable entries are skipped here but
    /// still occupy an index.
    pub async fn accumulated_snapshot<T>(&self) -> (Vec<T>, usize)
    where
        T: DeserializeOwned,
    {
        let key = &self.record().accumulated;
        match self.store().lrange(key, 0, -1).await {
            Ok(items) => {
                let len = items.len();
                let decoded = items.iter().filter_map(|raw| decode_chunk(raw)).collect();
                (decoded, len)
            }
            Err(err) => {
                error!(key = %key, error = %err, "failed to read accumulated stream data");
                (Vec::new(), 0)
            }
        }
    }

    /// Follows the buffer from `start_index` until the producer ends or the
    /// buffer stays silent for `max_empty_polls` consecutive polls.
    pub fn follow_stream<T>(&self, start_index: usize) -> BoxStream<'static, T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let state = FollowState {
            store: self.store(),
            accumulated: self.record().accumulated.clone(),
            streaming: self.record().streaming.clone(),
            next_index: start_index,
            empty_polls: 0,
            pending: VecDeque::new(),
            finished: false,
            poll_interval: self.config.poll_interval,
            max_empty_polls: self.config.max_empty_polls,
        };
        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(raw) = state.pending.pop_front() {
                    match decode_chunk(&raw) {
                        Some(chunk) => return Some((chunk, state)),
                        None => continue,
                    }
                }
                if state.finished || state.empty_polls >= state.max_empty_polls {
                    return None;
                }
                if let Err(err) = state.poll().await {
                    error!(key = %state.accumulated, error = %err, "error following stream");
                    return None;
                }
            }
        })
        .boxed()
    }

    /// Producer only: clears the live flag and the user's active pointer and
    /// keeps the buffer for a grace period so stragglers can still replay.
    pub async fn end_streaming(&mut self) {
        let store = self.store();
        let record = self.record().clone();
        if let Err(err) = store.delete(&[record.streaming.clone()]).await {
            error!(request_key = %self.request_key(), error = %err, "failed to clear stream flag");
        }
        self.inner.clear_active_request().await;
        if let Err(err) = store
            .expire(&record.accumulated, self.config.ended_grace)
            .await
        {
            error!(request_key = %self.request_key(), error = %err, "failed to shorten stream buffer ttl");
        }
        info!(request_key = %self.request_key(), "ended stream");
    }
}

struct FollowState {
    store: Arc<dyn KvStore>,
    accumulated: String,
    streaming: String,
    next_index: usize,
    empty_polls: u32,
    pending: VecDeque<String>,
    finished: bool,
    poll_interval: Duration,
    max_empty_polls: u32,
}

impl FollowState {
    /// The live flag is read before the buffer: once the flag is gone every
    /// append has already happened, so the final read drains the tail.
    async fn poll(&mut self) -> Result<(), KvError> {
        let live = self.store.get(&self.streaming).await?.is_some();
        let items = self
            .store
            .lrange(&self.accumulated, self.next_index as i64, -1)
            .await?;
        let received = items.len();
        self.next_index += received;
        self.pending.extend(items);

        if !live {
            info!(key = %self.accumulated, "stream has ended");
            self.finished = true;
        } else if received == 0 {
            self.empty_polls += 1;
            sleep(self.poll_interval).await;
        } else {
            self.empty_polls = 0;
        }
        Ok(())
    }
}

fn decode_chunk<T: DeserializeOwned>(raw: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(chunk) => Some(chunk),
        Err(err) => {
            error!(error = %err, "skipping undecodable stream chunk");
            None
        }
    }
}
