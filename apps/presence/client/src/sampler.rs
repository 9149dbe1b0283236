//! Raw device fixes in, significant samples out.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tripteller_presence_core::{Coordinates, ValidationError};

use crate::backoff::{Backoff, BackoffPolicy};

/// One position reading from the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub coordinates: Coordinates,
    pub accuracy: Option<f64>,
    /// Epoch millis at which the device produced the reading.
    pub captured_at: i64,
}

impl Fix {
    pub fn new(latitude: f64, longitude: f64, captured_at: i64) -> Self {
        Self {
            coordinates: Coordinates::new(latitude, longitude),
            accuracy: None,
            captured_at,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterConfig {
    pub min_interval: Duration,
    pub force_interval: Duration,
    pub distance_threshold_m: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(2),
            force_interval: Duration::from_secs(10),
            distance_threshold_m: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted,
    TooSoon,
    Unmoved { distance_m: f64 },
    Invalid(ValidationError),
}

/// Acceptance rule against the last accepted fix.
#[derive(Debug, Clone)]
pub struct SampleFilter {
    config: FilterConfig,
    last: Option<Fix>,
}

impl SampleFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config, last: None }
    }

    pub fn last_accepted(&self) -> Option<&Fix> {
        self.last.as_ref()
    }

    pub fn evaluate(&self, fix: &Fix) -> Verdict {
        if let Err(err) = fix.coordinates.validate() {
            return Verdict::Invalid(err);
        }
        let Some(last) = &self.last else {
            return Verdict::Accepted;
        };

        let elapsed_ms = fix.captured_at.saturating_sub(last.captured_at);
        if elapsed_ms < self.config.min_interval.as_millis() as i64 {
            return Verdict::TooSoon;
        }
        if elapsed_ms > self.config.force_interval.as_millis() as i64 {
            return Verdict::Accepted;
        }
        let distance_m = last.coordinates.distance_to(&fix.coordinates);
        if distance_m > self.config.distance_threshold_m {
            Verdict::Accepted
        } else {
            Verdict::Unmoved { distance_m }
        }
    }

    /// Evaluates and, on acceptance, records the fix as the new reference.
    pub fn offer(&mut self, fix: Fix) -> Verdict {
        let verdict = self.evaluate(&fix);
        if verdict == Verdict::Accepted {
            self.last = Some(fix);
        }
        verdict
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PositionError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("timed out waiting for a position")]
    Timeout,
    #[error("position unavailable: {0}")]
    Unavailable(String),
    #[error("position source ended")]
    Ended,
}

impl PositionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PositionError::Timeout | PositionError::Unavailable(_))
    }
}

/// Device geolocation, or anything standing in for it.
#[async_trait]
pub trait PositionSource: Send {
    async fn permission(&mut self) -> Permission;
    async fn next_fix(&mut self) -> Result<Fix, PositionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Watching,
    Retrying,
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position source kept failing after {attempts} retries: {last}")]
    RetriesExhausted { attempts: u32, last: PositionError },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SamplerSummary {
    pub accepted: u64,
    pub filtered: u64,
    pub invalid: u64,
}

pub struct LocationSampler<S> {
    source: S,
    filter: SampleFilter,
    backoff: BackoffPolicy,
    state: watch::Sender<SamplerState>,
}

impl<S: PositionSource> LocationSampler<S> {
    pub fn new(source: S, filter: FilterConfig, backoff: BackoffPolicy) -> Self {
        let (state, _) = watch::channel(SamplerState::Idle);
        Self {
            source,
            filter: SampleFilter::new(filter),
            backoff,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<SamplerState> {
        self.state.subscribe()
    }

    /// Watches the source until cancelled, the source ends, or the output
    /// receiver goes away. Accepted fixes are forwarded on `output`.
    pub async fn run(
        mut self,
        output: mpsc::Sender<Fix>,
        cancel: CancellationToken,
    ) -> Result<SamplerSummary, SamplerError> {
        if self.source.permission().await == Permission::Denied {
            warn!("location permission denied; sampler stays idle");
            return Err(SamplerError::PermissionDenied);
        }
        self.state.send_replace(SamplerState::Watching);

        let mut summary = SamplerSummary::default();
        let mut retries = Backoff::new(self.backoff);
        let outcome = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                next = self.source.next_fix() => next,
            };

            match next {
                Ok(fix) => {
                    if retries.attempt() > 0 {
                        info!(attempts = retries.attempt(), "position source recovered");
                        retries.reset();
                    }
                    self.state.send_replace(SamplerState::Watching);

                    match self.filter.offer(fix) {
                        Verdict::Accepted => {
                            summary.accepted += 1;
                            if output.send(fix).await.is_err() {
                                debug!("sample consumer gone; stopping sampler");
                                break Ok(());
                            }
                        }
                        Verdict::Invalid(err) => {
                            summary.invalid += 1;
                            warn!(error = %err, "discarding invalid fix");
                        }
                        Verdict::TooSoon | Verdict::Unmoved { .. } => summary.filtered += 1,
                    }
                }
                Err(PositionError::Ended) => break Ok(()),
                Err(PositionError::PermissionDenied) => break Err(SamplerError::PermissionDenied),
                Err(err) => {
                    let attempts = retries.attempt();
                    let Some(delay) = retries.next_delay() else {
                        break Err(SamplerError::RetriesExhausted { attempts, last: err });
                    };
                    self.state.send_replace(SamplerState::Retrying);
                    warn!(error = %err, delay_ms = delay.as_millis() as u64, "position error; retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break Ok(()),
                        _ = sleep(delay) => {}
                    }
                }
            }
        };

        self.state.send_replace(SamplerState::Idle);
        outcome.map(|()| summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    // 1e-5 degrees of latitude is about 1.11 m.
    const METRE_DEG: f64 = 1.0 / 111_195.0;

    fn filter() -> SampleFilter {
        SampleFilter::new(FilterConfig::default())
    }

    #[test]
    fn first_fix_is_always_accepted() {
        assert_eq!(filter().evaluate(&Fix::new(13.0, 80.0, 0)), Verdict::Accepted);
    }

    #[test]
    fn small_moves_are_filtered_and_larger_ones_pass() {
        let mut filter = filter();
        assert_eq!(filter.offer(Fix::new(13.0, 80.0, 0)), Verdict::Accepted);
        assert!(matches!(
            filter.evaluate(&Fix::new(13.0 + 4.0 * METRE_DEG, 80.0, 3_000)),
            Verdict::Unmoved { .. }
        ));
        assert_eq!(
            filter.evaluate(&Fix::new(13.0 + 6.0 * METRE_DEG, 80.0, 3_000)),
            Verdict::Accepted
        );
    }

    #[test]
    fn force_interval_accepts_without_movement() {
        let mut filter = filter();
        filter.offer(Fix::new(13.0, 80.0, 0));
        assert!(matches!(
            filter.evaluate(&Fix::new(13.0, 80.0, 9_000)),
            Verdict::Unmoved { .. }
        ));
        assert_eq!(filter.evaluate(&Fix::new(13.0, 80.0, 11_000)), Verdict::Accepted);
    }

    #[test]
    fn min_interval_rejects_even_large_moves() {
        let mut filter = filter();
        filter.offer(Fix::new(13.0, 80.0, 0));
        assert_eq!(
            filter.evaluate(&Fix::new(13.1, 80.0, 1_000)),
            Verdict::TooSoon
        );
    }

    #[test]
    fn invalid_fixes_never_pass() {
        assert!(matches!(
            filter().evaluate(&Fix::new(f64::NAN, 0.0, 0)),
            Verdict::Invalid(ValidationError::NonFinite)
        ));
        assert!(matches!(
            filter().evaluate(&Fix::new(0.0, 181.0, 0)),
            Verdict::Invalid(ValidationError::LongitudeOutOfRange(_))
        ));
    }

    struct ScriptedSource {
        permission: Permission,
        script: VecDeque<Result<Fix, PositionError>>,
    }

    #[async_trait]
    impl PositionSource for ScriptedSource {
        async fn permission(&mut self) -> Permission {
            self.permission
        }

        async fn next_fix(&mut self) -> Result<Fix, PositionError> {
            self.script.pop_front().unwrap_or(Err(PositionError::Ended))
        }
    }

    fn sampler(
        permission: Permission,
        script: Vec<Result<Fix, PositionError>>,
        max_attempts: u32,
    ) -> LocationSampler<ScriptedSource> {
        LocationSampler::new(
            ScriptedSource {
                permission,
                script: script.into(),
            },
            FilterConfig::default(),
            BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), max_attempts),
        )
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn denied_permission_is_terminal() {
        let sampler = sampler(Permission::Denied, vec![Ok(Fix::new(1.0, 1.0, 0))], 3);
        let state = sampler.state();
        let (tx, _rx) = mpsc::channel(4);
        let result = sampler.run(tx, CancellationToken::new()).await;
        assert!(matches!(result, Err(SamplerError::PermissionDenied)));
        assert_eq!(*state.borrow(), SamplerState::Idle);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn transient_errors_are_retried() {
        let sampler = sampler(
            Permission::Granted,
            vec![
                Ok(Fix::new(13.0, 80.0, 0)),
                Err(PositionError::Timeout),
                Err(PositionError::Unavailable("no signal".into())),
                Ok(Fix::new(13.001, 80.0, 20_000)),
                Ok(Fix::new(13.001, 80.0, 20_500)),
            ],
            5,
        );
        let (tx, mut rx) = mpsc::channel(8);
        let summary = sampler.run(tx, CancellationToken::new()).await.unwrap();
        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.filtered, 1);
        assert_eq!(rx.recv().await.unwrap().captured_at, 0);
        assert_eq!(rx.recv().await.unwrap().captured_at, 20_000);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn persistent_errors_give_up() {
        let sampler = sampler(
            Permission::Granted,
            vec![
                Err(PositionError::Timeout),
                Err(PositionError::Timeout),
                Err(PositionError::Timeout),
            ],
            2,
        );
        let (tx, _rx) = mpsc::channel(8);
        let result = sampler.run(tx, CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(SamplerError::RetriesExhausted { attempts: 2, .. })
        ));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn cancellation_stops_a_retrying_sampler() {
        let sampler = sampler(Permission::Granted, vec![Err(PositionError::Timeout)], 5);
        let mut state = sampler.state();
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(8);
        let task = tokio::spawn(sampler.run(tx, cancel.clone()));

        state
            .wait_for(|state| *state == SamplerState::Retrying)
            .await
            .unwrap();
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}
