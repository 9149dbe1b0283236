use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::now_ms;
use crate::presence::{PresenceRegistry, SweepReport};

/// Periodic safety net for sockets that vanished without a clean close.
pub struct Reaper {
    registry: Arc<PresenceRegistry>,
    interval: Duration,
    stale_timeout: Duration,
}

impl Reaper {
    pub fn new(registry: Arc<PresenceRegistry>, interval: Duration, stale_timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            stale_timeout,
        }
    }

    pub fn sweep(&self, now: u64) -> SweepReport {
        let report = self
            .registry
            .sweep(now, self.stale_timeout.as_millis() as u64);
        if !report.reaped.is_empty() {
            counter!(
                "tripteller_presence_subjects_reaped_total",
                report.reaped.len() as u64
            );
            for subject in &report.reaped {
                info!(
                    subject_id = %subject.id,
                    idle_ms = now.saturating_sub(subject.last_seen_at),
                    "reaped inactive subject"
                );
            }
        }
        if report.observers_removed > 0 {
            counter!(
                "tripteller_presence_observers_reaped_total",
                report.observers_removed as u64
            );
            debug!(
                count = report.observers_removed,
                idle = report.observers_idle,
                "dropped dead observers"
            );
        }
        report
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let mut interval = tokio::time::interval(self.interval);
        tokio::spawn(async move {
            // first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let _ = self.sweep(now_ms());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{ObserverMeta, Position, RegistryConfig, Subject, Upsert};
    use tokio::sync::mpsc;
    use tripteller_presence_core::{Coordinates, DepartureReason, ServerEvent};
    use uuid::Uuid;

    const MINUTE: u64 = 60_000;

    fn reaper() -> Reaper {
        let registry = Arc::new(PresenceRegistry::new(RegistryConfig {
            observer_idle_ms: 60 * MINUTE,
            ..RegistryConfig::default()
        }));
        Reaper::new(
            registry,
            Duration::from_secs(120),
            Duration::from_secs(300),
        )
    }

    fn seed(reaper: &Reaper, id: &str, at: u64) {
        let subject = Subject {
            id: id.into(),
            display_name: None,
            position: Position {
                coordinates: Coordinates::new(13.0, 80.0),
                accuracy: None,
                captured_at: at as i64,
            },
            connection_id: Uuid::new_v4(),
            last_seen_at: at,
            last_sample_at: at,
        };
        assert!(matches!(
            reaper.registry.upsert_subject(subject),
            Upsert::Accepted { .. }
        ));
    }

    #[test]
    fn subject_silent_for_six_minutes_departs_exactly_once() {
        let reaper = reaper();
        let (tx, mut rx) = mpsc::channel(8);
        reaper
            .registry
            .add_observer(Uuid::new_v4(), ObserverMeta::default(), tx, 0);
        let _ = rx.try_recv();

        seed(&reaper, "u1", 0);
        let _ = rx.try_recv();

        assert!(reaper.sweep(4 * MINUTE).reaped.is_empty());
        assert_eq!(reaper.sweep(6 * MINUTE).reaped.len(), 1);
        assert!(reaper.sweep(8 * MINUTE).reaped.is_empty());

        match rx.try_recv() {
            Ok(ServerEvent::SubjectDeparted(departed)) => {
                assert_eq!(departed.subject_id, "u1");
                assert_eq!(departed.reason, DepartureReason::Inactive);
            }
            other => panic!("expected departure, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fresh_subjects_survive() {
        let reaper = reaper();
        seed(&reaper, "u1", 0);
        seed(&reaper, "u2", 5 * MINUTE);
        let report = reaper.sweep(6 * MINUTE);
        assert_eq!(report.reaped.len(), 1);
        assert_eq!(reaper.registry.subject_count(), 1);
    }

    #[test]
    fn quiet_observer_is_dropped_without_touching_subjects() {
        let registry = Arc::new(PresenceRegistry::new(RegistryConfig {
            observer_idle_ms: 90_000,
            ..RegistryConfig::default()
        }));
        let reaper = Reaper::new(registry, Duration::from_secs(120), Duration::from_secs(300));
        let (tx, _rx) = mpsc::channel(8);
        reaper
            .registry
            .add_observer(Uuid::new_v4(), ObserverMeta::default(), tx, 0);
        seed(&reaper, "u1", 2 * MINUTE);

        let report = reaper.sweep(2 * MINUTE);
        assert_eq!(report.observers_idle, 1);
        assert!(report.reaped.is_empty());
        assert_eq!(reaper.registry.observer_count(), 0);
        assert_eq!(reaper.registry.subject_count(), 1);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn spawned_reaper_can_be_aborted() {
        let handle = reaper().spawn();
        tokio::time::sleep(Duration::from_secs(300)).await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
