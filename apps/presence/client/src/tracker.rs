//! Worker-side tracking session: sampler output goes out over the presence
//! link and into the history store.

use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tripteller_presence_core::{ClientEvent, LocationSample, StopTracking};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::connection::HealthMonitor;
use crate::offline::{OfflineSync, SaveOutcome, StoredSample, SyncError};
use crate::sampler::{
    FilterConfig, Fix, LocationSampler, PositionSource, SamplerError, SamplerSummary,
};

const FIX_BUFFER: usize = 32;

#[derive(Debug, Clone, Default)]
pub struct TrackerConfig {
    /// Falls back to the session id when unset.
    pub subject_id: Option<String>,
    pub display_name: Option<String>,
    pub filter: FilterConfig,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("presence link is not healthy; tracking not started")]
    UnhealthyLink,
    #[error("tracking already running")]
    AlreadyRunning,
    #[error(transparent)]
    Sampler(#[from] SamplerError),
    #[error("tracking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrackingReport {
    pub sampler: SamplerSummary,
    pub broadcast: u64,
    pub broadcast_skipped: u64,
    pub saved: u64,
    pub queued: u64,
}

pub struct Tracker {
    monitor: HealthMonitor,
    sync: Option<Arc<OfflineSync>>,
    config: TrackerConfig,
    session_id: String,
    running: Option<(CancellationToken, JoinHandle<Result<TrackingReport, SamplerError>>)>,
}

impl Tracker {
    pub fn new(monitor: HealthMonitor, config: TrackerConfig) -> Self {
        Self {
            monitor,
            sync: None,
            config,
            session_id: format!("session-{}", Uuid::new_v4()),
            running: None,
        }
    }

    pub fn with_sync(mut self, sync: Arc<OfflineSync>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn subject_id(&self) -> &str {
        self.config
            .subject_id
            .as_deref()
            .unwrap_or(&self.session_id)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|(_, task)| !task.is_finished())
    }

    /// Starts sampling `source`. An unhealthy link gets one connect attempt
    /// before the start is refused.
    pub async fn start<S>(&mut self, source: S) -> Result<(), TrackerError>
    where
        S: PositionSource + 'static,
    {
        if self.running.is_some() {
            return Err(TrackerError::AlreadyRunning);
        }
        if !self.monitor.is_healthy() {
            if let Err(err) = self.monitor.connect().await {
                warn!(error = %err, "connect before tracking failed");
            }
            if !self.monitor.is_healthy() {
                return Err(TrackerError::UnhealthyLink);
            }
        }

        let cancel = CancellationToken::new();
        let sampler = LocationSampler::new(source, self.config.filter, self.config.backoff);
        let pump = Pump {
            monitor: self.monitor.clone(),
            sync: self.sync.clone(),
            subject_id: self.subject_id().to_owned(),
            display_name: self.config.display_name.clone(),
            session_id: self.session_id.clone(),
        };
        let (tx, rx) = mpsc::channel(FIX_BUFFER);
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let (summary, mut report) = tokio::join!(sampler.run(tx, cancel), pump.run(rx));
                report.sampler = summary?;
                Ok::<_, SamplerError>(report)
            }
        });

        info!(subject_id = %self.subject_id(), session_id = %self.session_id, "tracking started");
        self.running = Some((cancel, task));
        Ok(())
    }

    /// Stops sampling and tells observers the subject left.
    pub async fn stop(&mut self) -> Result<TrackingReport, TrackerError> {
        self.finish(true).await
    }

    /// Waits for the source to run dry, then leaves like [`Tracker::stop`].
    pub async fn join(&mut self) -> Result<TrackingReport, TrackerError> {
        self.finish(false).await
    }

    async fn finish(&mut self, cancel: bool) -> Result<TrackingReport, TrackerError> {
        let Some((token, task)) = self.running.as_mut() else {
            return Ok(TrackingReport::default());
        };
        if cancel {
            token.cancel();
        }
        // stays in place if this future is dropped, so a later stop() still finds it
        let outcome = task.await;
        self.running = None;

        let left = self.monitor.safe_send(&ClientEvent::StopTracking(StopTracking {
            subject_id: self.subject_id().to_owned(),
        }));
        if !left {
            debug!("stop-tracking not delivered; server will reap the subject");
        }

        let report = outcome??;
        info!(
            accepted = report.sampler.accepted,
            broadcast = report.broadcast,
            queued = report.queued,
            "tracking stopped"
        );
        Ok(report)
    }
}

struct Pump {
    monitor: HealthMonitor,
    sync: Option<Arc<OfflineSync>>,
    subject_id: String,
    display_name: Option<String>,
    session_id: String,
}

impl Pump {
    async fn run(self, mut fixes: mpsc::Receiver<Fix>) -> TrackingReport {
        let mut report = TrackingReport::default();
        while let Some(fix) = fixes.recv().await {
            let sample = LocationSample {
                subject_id: self.subject_id.clone(),
                latitude: fix.coordinates.latitude,
                longitude: fix.coordinates.longitude,
                accuracy: fix.accuracy,
                display_name: self.display_name.clone(),
                captured_at: fix.captured_at,
            };
            if self.monitor.safe_send(&ClientEvent::LocationSample(sample)) {
                report.broadcast += 1;
            } else {
                report.broadcast_skipped += 1;
            }

            let Some(sync) = &self.sync else { continue };
            match sync.save(self.stored(&fix)).await {
                Ok(SaveOutcome::Saved) => report.saved += 1,
                Ok(SaveOutcome::Queued) => report.queued += 1,
                Err(SyncError::ReauthRequired) => {
                    report.queued += 1;
                    warn!("history store wants a fresh sign-in; samples are being held");
                }
                Err(SyncError::Rejected(reason)) => {
                    warn!(%reason, "history store rejected sample");
                }
            }
        }
        report
    }

    fn stored(&self, fix: &Fix) -> StoredSample {
        let timestamp =
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(fix.captured_at) * 1_000_000)
                .unwrap_or_else(|_| OffsetDateTime::now_utc());
        StoredSample {
            latitude: fix.coordinates.latitude,
            longitude: fix.coordinates.longitude,
            accuracy: fix.accuracy,
            session_id: self.session_id.clone(),
            timestamp,
        }
    }
}
