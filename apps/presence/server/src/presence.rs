//! Authoritative in-memory record of who is online and who is watching.
//!
//! Subjects and observers live behind one mutex. Every logical operation,
//! including a full fan-out pass, runs inside a single critical section, so an
//! observer can never see a half-applied subject set. Deliveries use
//! `try_send` on bounded per-connection channels and never await while the
//! lock is held.

use std::collections::HashMap;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use slab::Slab;
use tokio::sync::mpsc::{self, error::TrySendError};
use tripteller_presence_core::{
    Coordinates, DepartureReason, ServerEvent, SubjectDeparted, SubjectUpdate,
};
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub coordinates: Coordinates,
    pub accuracy: Option<f64>,
    pub captured_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub id: String,
    pub display_name: Option<String>,
    pub position: Position,
    pub connection_id: ConnectionId,
    /// Millis of the last accepted sample or heartbeat.
    pub last_seen_at: u64,
    /// Millis of the last accepted sample; heartbeats leave it alone.
    pub last_sample_at: u64,
}

impl Subject {
    pub fn to_update(&self) -> SubjectUpdate {
        SubjectUpdate {
            subject_id: self.id.clone(),
            latitude: self.position.coordinates.latitude,
            longitude: self.position.coordinates.longitude,
            display_name: self.display_name.clone(),
            captured_at: self.position.captured_at,
        }
    }

    fn departure(&self, reason: DepartureReason) -> ServerEvent {
        ServerEvent::SubjectDeparted(SubjectDeparted {
            subject_id: self.id.clone(),
            display_name: self.display_name.clone(),
            reason,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ObserverMeta {
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObserverInfo {
    pub connection_id: ConnectionId,
    pub display_name: Option<String>,
    pub joined_at: u64,
    pub last_ack_at: u64,
    pub last_active_at: u64,
    pub live: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub max_delivery_failures: u32,
    pub min_sample_interval_ms: u64,
    /// Observers that send no frame for this long are dropped by the sweep.
    pub observer_idle_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_delivery_failures: 3,
            min_sample_interval_ms: 500,
            observer_idle_ms: 90_000,
        }
    }
}

/// Outcome of delivering one event to every observer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
    pub evicted: usize,
}

impl FanOut {
    fn absorb(&mut self, other: FanOut) {
        self.delivered += other.delivered;
        self.dropped += other.dropped;
        self.evicted += other.evicted;
    }
}

#[derive(Debug)]
pub enum Upsert {
    Accepted {
        previous: Option<Subject>,
        fan_out: FanOut,
    },
    RateLimited {
        retry_in_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddObserver {
    Joined { snapshot_len: usize },
    AlreadyJoined { active_subjects: usize },
    /// The outbound buffer had no room for the snapshot; nothing was registered.
    Busy,
    ConnectionClosed,
}

#[derive(Debug)]
pub struct Removed {
    pub subject: Subject,
    pub fan_out: FanOut,
}

#[derive(Debug, Default)]
pub struct Departure {
    pub observer_removed: bool,
    pub departed: Vec<Subject>,
    pub fan_out: FanOut,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub reaped: Vec<Subject>,
    /// Closed and idle observers together.
    pub observers_removed: usize,
    pub observers_idle: usize,
    pub fan_out: FanOut,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Teardown {
    pub subjects: usize,
    pub observers: usize,
}

pub struct PresenceRegistry {
    state: Mutex<PresenceState>,
    config: RegistryConfig,
}

#[derive(Default)]
struct PresenceState {
    subjects: HashMap<String, Subject>,
    observers: Slab<ObserverEntry>,
    observer_index: HashMap<ConnectionId, usize>,
}

struct ObserverEntry {
    connection_id: ConnectionId,
    display_name: Option<String>,
    joined_at: u64,
    last_ack_at: u64,
    last_active_at: u64,
    consecutive_failures: u32,
    sender: mpsc::Sender<ServerEvent>,
}

impl PresenceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            state: Mutex::new(PresenceState::default()),
            config,
        }
    }

    pub fn subject_count(&self) -> usize {
        self.state.lock().subjects.len()
    }

    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    pub fn observers(&self) -> Vec<ObserverInfo> {
        let guard = self.state.lock();
        guard
            .observers
            .iter()
            .map(|(_, entry)| ObserverInfo {
                connection_id: entry.connection_id,
                display_name: entry.display_name.clone(),
                joined_at: entry.joined_at,
                last_ack_at: entry.last_ack_at,
                last_active_at: entry.last_active_at,
                live: !entry.sender.is_closed(),
            })
            .collect()
    }

    /// Point-in-time copy of every live subject.
    pub fn snapshot_subjects(&self) -> Vec<Subject> {
        let guard = self.state.lock();
        let mut subjects: Vec<Subject> = guard.subjects.values().cloned().collect();
        subjects.sort_by(|a, b| a.id.cmp(&b.id));
        subjects
    }

    /// Replaces any prior entry for `subject.id` and delivers the delta to every
    /// observer in one critical section. The previous entry, if any, comes back
    /// in the outcome. Samples closer together than the configured minimum
    /// interval are refused without touching the registry.
    pub(crate) fn upsert_subject(&self, subject: Subject) -> Upsert {
        let mut guard = self.state.lock();

        if let Some(existing) = guard.subjects.get(&subject.id) {
            let elapsed = subject.last_sample_at.saturating_sub(existing.last_sample_at);
            if elapsed < self.config.min_sample_interval_ms {
                return Upsert::RateLimited {
                    retry_in_ms: self.config.min_sample_interval_ms - elapsed,
                };
            }
        }

        let event = ServerEvent::SubjectUpdate(subject.to_update());
        let now = subject.last_seen_at;
        let previous = guard.subjects.insert(subject.id.clone(), subject);
        gauge!("tripteller_presence_subjects_active", guard.subjects.len() as f64);
        let fan_out = guard.fan_out(&event, now, self.config.max_delivery_failures);

        Upsert::Accepted { previous, fan_out }
    }

    /// Removes a subject and announces its departure. When `owner` is given the
    /// subject is only removed while that connection still reports it.
    /// Returns `None` when nothing was removed.
    pub(crate) fn remove_subject(
        &self,
        subject_id: &str,
        owner: Option<ConnectionId>,
        reason: DepartureReason,
        now: u64,
    ) -> Option<Removed> {
        let mut guard = self.state.lock();
        let owned = guard
            .subjects
            .get(subject_id)
            .is_some_and(|subject| owner.map_or(true, |id| subject.connection_id == id));
        if !owned {
            return None;
        }
        let subject = guard.subjects.remove(subject_id)?;
        let fan_out = guard.fan_out(
            &subject.departure(reason),
            now,
            self.config.max_delivery_failures,
        );
        gauge!("tripteller_presence_subjects_active", guard.subjects.len() as f64);
        Some(Removed { subject, fan_out })
    }

    /// Registers an observer and seeds it with the current snapshot before it
    /// can receive any live delta. Duplicate joins are no-ops. An observer is
    /// only registered once its snapshot is queued.
    pub(crate) fn add_observer(
        &self,
        connection_id: ConnectionId,
        meta: ObserverMeta,
        sender: mpsc::Sender<ServerEvent>,
        now: u64,
    ) -> AddObserver {
        let mut guard = self.state.lock();

        if guard.observer_index.contains_key(&connection_id) {
            return AddObserver::AlreadyJoined {
                active_subjects: guard.subjects.len(),
            };
        }

        let mut snapshot: Vec<SubjectUpdate> =
            guard.subjects.values().map(Subject::to_update).collect();
        snapshot.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));
        let snapshot_len = snapshot.len();

        match sender.try_send(ServerEvent::SubjectSnapshot(snapshot)) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => return AddObserver::ConnectionClosed,
            Err(TrySendError::Full(_)) => return AddObserver::Busy,
        }

        let key = guard.observers.insert(ObserverEntry {
            connection_id,
            display_name: meta.display_name,
            joined_at: now,
            last_ack_at: now,
            last_active_at: now,
            consecutive_failures: 0,
            sender,
        });
        guard.observer_index.insert(connection_id, key);
        gauge!("tripteller_presence_observers_active", guard.observers.len() as f64);

        AddObserver::Joined { snapshot_len }
    }

    pub(crate) fn remove_observer(&self, connection_id: ConnectionId) -> bool {
        let mut guard = self.state.lock();
        let removed = guard.remove_observer(connection_id);
        gauge!("tripteller_presence_observers_active", guard.observers.len() as f64);
        removed
    }

    /// Marks the connection's observer entry, if any, as recently heard from.
    pub(crate) fn touch_observer(&self, connection_id: ConnectionId, now: u64) -> bool {
        self.state.lock().touch_observer(connection_id, now)
    }

    /// Refreshes `last_seen_at` of every subject currently reporting over the
    /// connection, and the connection's observer activity.
    pub(crate) fn touch_connection(&self, connection_id: ConnectionId, now: u64) -> usize {
        let mut guard = self.state.lock();
        guard.touch_observer(connection_id, now);
        let mut touched = 0;
        for subject in guard.subjects.values_mut() {
            if subject.connection_id == connection_id {
                subject.last_seen_at = subject.last_seen_at.max(now);
                touched += 1;
            }
        }
        touched
    }

    /// Drops everything owned by a closed connection: its observer entry and
    /// any subject whose current connection it still is. Remaining observers
    /// are told about each departed subject.
    pub(crate) fn depart_connection(&self, connection_id: ConnectionId, now: u64) -> Departure {
        let mut guard = self.state.lock();
        let mut departure = Departure {
            observer_removed: guard.remove_observer(connection_id),
            ..Departure::default()
        };

        let owned: Vec<String> = guard
            .subjects
            .values()
            .filter(|subject| subject.connection_id == connection_id)
            .map(|subject| subject.id.clone())
            .collect();

        for subject_id in owned {
            if let Some(subject) = guard.subjects.remove(&subject_id) {
                let event = subject.departure(DepartureReason::Disconnected);
                let fan_out = guard.fan_out(&event, now, self.config.max_delivery_failures);
                departure.fan_out.absorb(fan_out);
                departure.departed.push(subject);
            }
        }

        gauge!("tripteller_presence_subjects_active", guard.subjects.len() as f64);
        gauge!("tripteller_presence_observers_active", guard.observers.len() as f64);
        departure
    }

    /// Evicts subjects silent for longer than `stale_after_ms` (announcing each
    /// once) and silently drops observers whose socket has gone away or that
    /// have sent nothing for the configured idle timeout.
    pub(crate) fn sweep(&self, now: u64, stale_after_ms: u64) -> SweepReport {
        let mut guard = self.state.lock();
        let mut report = SweepReport::default();
        let idle_after_ms = self.config.observer_idle_ms;

        let dead: Vec<(ConnectionId, bool)> = guard
            .observers
            .iter()
            .filter_map(|(_, entry)| {
                let idle = now.saturating_sub(entry.last_active_at) > idle_after_ms;
                (idle || entry.sender.is_closed()).then_some((entry.connection_id, idle))
            })
            .collect();
        for (connection_id, idle) in dead {
            if guard.remove_observer(connection_id) {
                report.observers_removed += 1;
                if idle {
                    report.observers_idle += 1;
                }
            }
        }

        let stale: Vec<String> = guard
            .subjects
            .values()
            .filter(|subject| now.saturating_sub(subject.last_seen_at) > stale_after_ms)
            .map(|subject| subject.id.clone())
            .collect();

        for subject_id in stale {
            if let Some(subject) = guard.subjects.remove(&subject_id) {
                let event = subject.departure(DepartureReason::Inactive);
                let fan_out = guard.fan_out(&event, now, self.config.max_delivery_failures);
                report.fan_out.absorb(fan_out);
                report.reaped.push(subject);
            }
        }

        gauge!("tripteller_presence_subjects_active", guard.subjects.len() as f64);
        gauge!("tripteller_presence_observers_active", guard.observers.len() as f64);
        report
    }

    /// Clears both maps. Writer tasks keep running until their sockets close,
    /// since each connection still holds its own sender.
    pub fn shutdown(&self) -> Teardown {
        let mut guard = self.state.lock();
        let teardown = Teardown {
            subjects: guard.subjects.len(),
            observers: guard.observers.len(),
        };
        guard.subjects.clear();
        guard.observers.clear();
        guard.observer_index.clear();
        gauge!("tripteller_presence_subjects_active", 0.0);
        gauge!("tripteller_presence_observers_active", 0.0);
        teardown
    }
}

impl PresenceState {
    fn touch_observer(&mut self, connection_id: ConnectionId, now: u64) -> bool {
        let Some(&key) = self.observer_index.get(&connection_id) else {
            return false;
        };
        match self.observers.get_mut(key) {
            Some(entry) => {
                entry.last_active_at = entry.last_active_at.max(now);
                true
            }
            None => false,
        }
    }

    fn remove_observer(&mut self, connection_id: ConnectionId) -> bool {
        match self.observer_index.remove(&connection_id) {
            Some(key) => {
                self.observers.remove(key);
                true
            }
            None => false,
        }
    }

    fn fan_out(&mut self, event: &ServerEvent, now: u64, max_failures: u32) -> FanOut {
        let mut report = FanOut::default();
        let mut evict = Vec::new();

        for (key, entry) in self.observers.iter_mut() {
            match entry.sender.try_send(event.clone()) {
                Ok(()) => {
                    entry.last_ack_at = now;
                    entry.consecutive_failures = 0;
                    report.delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    entry.consecutive_failures += 1;
                    report.dropped += 1;
                    counter!(
                        "tripteller_presence_flow_control_drops_total",
                        1,
                        "kind" => "observer"
                    );
                    tracing::debug!(
                        connection_id = %entry.connection_id,
                        failures = entry.consecutive_failures,
                        "observer buffer full; delivery dropped"
                    );
                    if entry.consecutive_failures >= max_failures {
                        evict.push((key, entry.connection_id));
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    evict.push((key, entry.connection_id));
                }
            }
        }

        for (key, connection_id) in evict {
            self.observers.remove(key);
            self.observer_index.remove(&connection_id);
            report.evicted += 1;
            counter!("tripteller_presence_observers_evicted_total", 1);
            tracing::debug!(connection_id = %connection_id, "evicted dead observer during fan-out");
        }

        gauge!("tripteller_presence_observers_active", self.observers.len() as f64);
        report
    }
}
