//! Durable save path for accepted samples, with a bounded backlog for when
//! the save endpoint is unreachable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
const SAVE_TIMEOUT: Duration = Duration::from_secs(15);
const BATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A sample as the history store records it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSample {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub session_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("authentication rejected; sign in again")]
    Unauthorized,
    #[error("store rejected the payload: {0}")]
    Rejected(String),
    #[error("store answered with status {0}")]
    Status(StatusCode),
    #[error("store reported failure: {0}")]
    Refused(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// History persistence for location samples.
#[async_trait]
pub trait SampleStore: Send + Sync {
    async fn save(&self, sample: &StoredSample) -> Result<(), StoreError>;
    /// Returns how many samples the store reports as saved.
    async fn save_batch(&self, samples: &[StoredSample]) -> Result<usize, StoreError>;
}

#[derive(Debug, Deserialize)]
struct SaveResponse {
    success: bool,
    #[serde(default)]
    saved: Option<usize>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    locations: &'a [StoredSample],
}

/// Talks to the REST history endpoints with a bearer token.
pub struct HttpSampleStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpSampleStore {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            token: token.into(),
        })
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        timeout: Duration,
    ) -> Result<SaveResponse, StoreError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .timeout(timeout)
            .json(body)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED => return Err(StoreError::Unauthorized),
            StatusCode::BAD_REQUEST => {
                let detail = response.text().await.unwrap_or_default();
                return Err(StoreError::Rejected(detail));
            }
            status if !status.is_success() => return Err(StoreError::Status(status)),
            _ => {}
        }

        let payload: SaveResponse = response.json().await?;
        if !payload.success {
            return Err(StoreError::Refused(
                payload.error.unwrap_or_else(|| "save failed".into()),
            ));
        }
        Ok(payload)
    }
}

#[async_trait]
impl SampleStore for HttpSampleStore {
    async fn save(&self, sample: &StoredSample) -> Result<(), StoreError> {
        self.post("/api/location/save", sample, SAVE_TIMEOUT).await?;
        Ok(())
    }

    async fn save_batch(&self, samples: &[StoredSample]) -> Result<usize, StoreError> {
        let response = self
            .post(
                "/api/location/save-batch",
                &BatchRequest { locations: samples },
                BATCH_TIMEOUT,
            )
            .await?;
        Ok(response.saved.unwrap_or(samples.len()))
    }
}

/// Bounded FIFO; the oldest samples go first when full.
#[derive(Debug)]
pub struct OfflineBuffer {
    entries: VecDeque<(u64, StoredSample)>,
    capacity: usize,
    next_seq: u64,
}

impl OfflineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a sample and returns how many old ones were evicted for it.
    pub fn push(&mut self, sample: StoredSample) -> usize {
        self.entries.push_back((self.next_seq, sample));
        self.next_seq += 1;
        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    pub fn samples(&self) -> Vec<StoredSample> {
        self.entries.iter().map(|(_, sample)| sample.clone()).collect()
    }

    fn batch(&self) -> Option<(u64, Vec<StoredSample>)> {
        let (last_seq, _) = self.entries.back()?;
        Some((*last_seq, self.samples()))
    }

    /// Drops everything up to and including `seq`; later pushes survive.
    fn acknowledge_through(&mut self, seq: u64) {
        while self
            .entries
            .front()
            .is_some_and(|(entry_seq, _)| *entry_seq <= seq)
        {
            self.entries.pop_front();
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication rejected; sign in again")]
    ReauthRequired,
    #[error("sample rejected by the store: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    AlreadyInFlight,
    Flushed(usize),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub online: bool,
    pub pending: usize,
    pub saved_count: u64,
    pub flushing: bool,
    pub needs_reauth: bool,
    pub last_error: Option<String>,
}

struct SyncState {
    buffer: OfflineBuffer,
    online: bool,
    saved_count: u64,
    needs_reauth: bool,
    last_error: Option<String>,
}

/// Saves samples one by one while online and batches the backlog otherwise.
pub struct OfflineSync {
    store: Arc<dyn SampleStore>,
    state: Mutex<SyncState>,
    flushing: AtomicBool,
}

struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OfflineSync {
    pub fn new(store: Arc<dyn SampleStore>, capacity: usize) -> Self {
        Self {
            store,
            state: Mutex::new(SyncState {
                buffer: OfflineBuffer::new(capacity),
                online: true,
                saved_count: 0,
                needs_reauth: false,
                last_error: None,
            }),
            flushing: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> SyncStatus {
        let state = self.state.lock();
        SyncStatus {
            online: state.online,
            pending: state.buffer.len(),
            saved_count: state.saved_count,
            flushing: self.flushing.load(Ordering::Acquire),
            needs_reauth: state.needs_reauth,
            last_error: state.last_error.clone(),
        }
    }

    pub fn pending(&self) -> Vec<StoredSample> {
        self.state.lock().buffer.samples()
    }

    pub fn record_if_offline(&self, sample: StoredSample) {
        let mut state = self.state.lock();
        let evicted = state.buffer.push(sample);
        if evicted > 0 {
            debug!(evicted, "offline queue full; dropped oldest samples");
        }
        debug!(pending = state.buffer.len(), "sample queued offline");
    }

    /// Saves one sample, queueing it when offline or when the store fails.
    /// A successful save also drains the backlog.
    pub async fn save(&self, sample: StoredSample) -> Result<SaveOutcome, SyncError> {
        if !self.state.lock().online {
            self.record_if_offline(sample);
            return Ok(SaveOutcome::Queued);
        }

        match self.store.save(&sample).await {
            Ok(()) => {
                let backlog = {
                    let mut state = self.state.lock();
                    state.saved_count += 1;
                    state.last_error = None;
                    state.needs_reauth = false;
                    !state.buffer.is_empty()
                };
                if backlog {
                    self.flush().await?;
                }
                Ok(SaveOutcome::Saved)
            }
            Err(StoreError::Rejected(reason)) => {
                warn!(%reason, "store rejected sample; dropping it");
                self.state.lock().last_error = Some(reason.clone());
                Err(SyncError::Rejected(reason))
            }
            Err(StoreError::Unauthorized) => {
                self.record_if_offline(sample);
                let mut state = self.state.lock();
                state.needs_reauth = true;
                state.last_error = Some(StoreError::Unauthorized.to_string());
                Err(SyncError::ReauthRequired)
            }
            Err(err) => {
                warn!(error = %err, "failed to save sample; kept offline");
                self.record_if_offline(sample);
                self.state.lock().last_error = Some(err.to_string());
                Ok(SaveOutcome::Queued)
            }
        }
    }

    /// Submits the whole backlog as one batch. Concurrent calls while a batch
    /// is in flight return immediately.
    pub async fn flush(&self) -> Result<FlushOutcome, SyncError> {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return Ok(FlushOutcome::AlreadyInFlight);
        }
        let _guard = FlushGuard(&self.flushing);

        let pending = self.state.lock().buffer.batch();
        let Some((last_seq, batch)) = pending else {
            return Ok(FlushOutcome::Empty);
        };

        match self.store.save_batch(&batch).await {
            Ok(saved) => {
                let mut state = self.state.lock();
                state.buffer.acknowledge_through(last_seq);
                state.saved_count += batch.len() as u64;
                state.last_error = None;
                info!(submitted = batch.len(), saved, "offline backlog flushed");
                Ok(FlushOutcome::Flushed(batch.len()))
            }
            Err(StoreError::Unauthorized) => {
                let mut state = self.state.lock();
                state.needs_reauth = true;
                state.last_error = Some(StoreError::Unauthorized.to_string());
                Err(SyncError::ReauthRequired)
            }
            Err(err) => {
                warn!(error = %err, pending = batch.len(), "backlog flush failed; will retry");
                self.state.lock().last_error = Some(err.to_string());
                Ok(FlushOutcome::Failed(err.to_string()))
            }
        }
    }

    /// Network reachability changed. Coming back online drains the backlog.
    pub async fn set_online(&self, online: bool) -> Result<Option<FlushOutcome>, SyncError> {
        let was_online = std::mem::replace(&mut self.state.lock().online, online);
        if online && !was_online {
            info!("back online; flushing offline backlog");
            return self.flush().await.map(Some);
        }
        Ok(None)
    }

    /// App returned to the foreground.
    pub async fn on_visible(&self) -> Result<Option<FlushOutcome>, SyncError> {
        if !self.state.lock().online {
            return Ok(None);
        }
        self.flush().await.map(Some)
    }
}
