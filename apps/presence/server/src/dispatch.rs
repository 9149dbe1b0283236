//! Turns inbound socket frames into registry operations and replies.

use std::sync::Arc;

use metrics::{counter, histogram};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use tripteller_presence_core::{
    ClientEvent, Connected, DepartureReason, JoinObserver, LocationAck, LocationSample,
    ObserverJoined, Ping, Pong, Rejection, ServerEvent, StopTracking,
};

use crate::identity::Identity;
use crate::presence::{
    AddObserver, ConnectionId, ObserverMeta, Position, PresenceRegistry, Subject, Upsert,
};

pub const REASON_MALFORMED: &str = "malformed payload";
pub const REASON_RATE_LIMITED: &str = "rate limited";
pub const REASON_SUBJECT_MISMATCH: &str = "subject mismatch";
pub const REASON_ADMIN_REQUIRED: &str = "admin role required";
pub const REASON_BUSY: &str = "busy";

/// Per-socket state handed to every dispatcher call.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub identity: Option<Identity>,
    pub sender: mpsc::Sender<ServerEvent>,
}

impl ConnectionContext {
    pub fn new(identity: Option<Identity>, sender: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            id: ConnectionId::new_v4(),
            identity,
            sender,
        }
    }

    /// Replies to this connection only. A full outbound buffer drops the reply.
    fn reply(&self, event: ServerEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                counter!(
                    "tripteller_presence_replies_dropped_total",
                    1,
                    "event" => event.name()
                );
                warn!(connection_id = %self.id, event = event.name(), "outbound buffer full; reply dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// The only mutation path into the registry for socket traffic.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<PresenceRegistry>,
    require_identity: bool,
}

impl Dispatcher {
    pub fn new(registry: Arc<PresenceRegistry>, require_identity: bool) -> Self {
        Self {
            registry,
            require_identity,
        }
    }

    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    pub fn on_connect(&self, ctx: &ConnectionContext, now: u64) {
        counter!("tripteller_presence_connections_total", 1);
        ctx.reply(ServerEvent::Connected(Connected {
            connection_id: ctx.id.to_string(),
            server_time: now as i64,
        }));
    }

    /// Parses one text frame and routes it. Any frame counts as observer activity.
    pub fn handle_frame(&self, ctx: &ConnectionContext, text: &str, now: u64) {
        self.registry.touch_observer(ctx.id, now);
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                self.on_malformed(ctx, None, &err);
                return;
            }
        };
        let event_name = value
            .get("event")
            .and_then(Value::as_str)
            .map(str::to_owned);

        match serde_json::from_value::<ClientEvent>(value) {
            Ok(event) => {
                counter!("tripteller_presence_frames_total", 1, "event" => event.name());
                match event {
                    ClientEvent::LocationSample(sample) => self.on_location_event(ctx, sample, now),
                    ClientEvent::JoinObserver(join) => self.on_join_observer(ctx, join, now),
                    ClientEvent::StopTracking(stop) => self.on_stop_tracking(ctx, stop, now),
                    ClientEvent::Ping(ping) => self.on_ping(ctx, ping, now),
                }
            }
            Err(err) => self.on_malformed(ctx, event_name.as_deref(), &err),
        }
    }

    fn on_malformed(&self, ctx: &ConnectionContext, event: Option<&str>, err: &serde_json::Error) {
        counter!("tripteller_presence_malformed_frames_total", 1);
        warn!(connection_id = %ctx.id, event = ?event, error = %err, "malformed frame");
        if event == Some("location-sample") {
            self.reject_location(ctx, REASON_MALFORMED, "malformed");
        }
    }

    /// Validates, stores and fans out one sample, then acks the sender with the
    /// number of observers reached.
    pub fn on_location_event(&self, ctx: &ConnectionContext, sample: LocationSample, now: u64) {
        if let Err(err) = sample.validate() {
            warn!(
                connection_id = %ctx.id,
                subject_id = %sample.subject_id,
                error = %err,
                "rejected location sample"
            );
            self.reject_location(ctx, &err.to_string(), err.metric_label());
            return;
        }

        let subject_id = sample.subject_id.trim().to_owned();
        let mut display_name = sample.display_name.clone();
        if let Some(identity) = &ctx.identity {
            if !identity.is_admin() && identity.subject_id != subject_id {
                warn!(
                    connection_id = %ctx.id,
                    claimed = %subject_id,
                    owner = %identity.subject_id,
                    "worker reported a subject it does not own"
                );
                self.reject_location(ctx, REASON_SUBJECT_MISMATCH, "subject_mismatch");
                return;
            }
            if display_name.is_none() {
                display_name = identity.display_name.clone();
            }
        }

        let subject = Subject {
            id: subject_id,
            display_name,
            position: Position {
                coordinates: sample.coordinates(),
                accuracy: sample.accuracy,
                captured_at: sample.captured_at,
            },
            connection_id: ctx.id,
            last_seen_at: now,
            last_sample_at: now,
        };
        let subject_id = subject.id.clone();

        match self.registry.upsert_subject(subject) {
            Upsert::RateLimited { retry_in_ms } => {
                debug!(connection_id = %ctx.id, subject_id = %subject_id, retry_in_ms, "sample rate limited");
                self.reject_location(ctx, REASON_RATE_LIMITED, "rate_limited");
            }
            Upsert::Accepted { previous, fan_out } => {
                if let Some(previous) = previous {
                    if previous.connection_id != ctx.id {
                        info!(
                            subject_id = %subject_id,
                            from = %previous.connection_id,
                            to = %ctx.id,
                            "subject moved to a new connection"
                        );
                    }
                }
                counter!("tripteller_presence_samples_accepted_total", 1);
                histogram!("tripteller_presence_fanout_size", fan_out.delivered as f64);
                ctx.reply(ServerEvent::LocationAck(LocationAck {
                    success: true,
                    observers_reached: fan_out.delivered,
                }));
            }
        }
    }

    fn reject_location(&self, ctx: &ConnectionContext, reason: &str, label: &'static str) {
        counter!("tripteller_presence_samples_rejected_total", 1, "reason" => label);
        ctx.reply(ServerEvent::LocationRejected(Rejection::new(reason)));
    }

    /// Registers the connection as an observer. The snapshot is queued ahead of
    /// any live delta; the join confirmation follows it.
    pub fn on_join_observer(&self, ctx: &ConnectionContext, join: JoinObserver, now: u64) {
        let identity = ctx.identity.as_ref();
        if self.require_identity && !identity.is_some_and(Identity::is_admin) {
            counter!("tripteller_presence_observer_joins_rejected_total", 1);
            warn!(connection_id = %ctx.id, "observer join refused for non-admin identity");
            ctx.reply(ServerEvent::ObserverJoinRejected(Rejection::new(
                REASON_ADMIN_REQUIRED,
            )));
            return;
        }

        let meta = ObserverMeta {
            display_name: join
                .display_name
                .or_else(|| identity.and_then(|identity| identity.display_name.clone())),
        };

        match self
            .registry
            .add_observer(ctx.id, meta, ctx.sender.clone(), now)
        {
            AddObserver::Joined { snapshot_len } => {
                counter!("tripteller_presence_observer_joins_total", 1);
                info!(connection_id = %ctx.id, snapshot_len, "observer joined");
                ctx.reply(ServerEvent::ObserverJoined(ObserverJoined {
                    success: true,
                    active_subject_count: snapshot_len,
                    already_joined: false,
                }));
            }
            AddObserver::AlreadyJoined { active_subjects } => {
                debug!(connection_id = %ctx.id, "duplicate observer join");
                ctx.reply(ServerEvent::ObserverJoined(ObserverJoined {
                    success: true,
                    active_subject_count: active_subjects,
                    already_joined: true,
                }));
            }
            AddObserver::Busy => {
                counter!("tripteller_presence_observer_joins_rejected_total", 1);
                warn!(connection_id = %ctx.id, "outbound buffer full; observer join refused");
                ctx.reply(ServerEvent::ObserverJoinRejected(Rejection::new(REASON_BUSY)));
            }
            AddObserver::ConnectionClosed => {
                debug!(connection_id = %ctx.id, "observer went away before joining");
            }
        }
    }

    /// Ends tracking for a subject this connection reports and announces it as
    /// disconnected. Other connections' subjects are left alone.
    pub fn on_stop_tracking(&self, ctx: &ConnectionContext, stop: StopTracking, now: u64) {
        let subject_id = stop.subject_id.trim();
        match self
            .registry
            .remove_subject(subject_id, Some(ctx.id), DepartureReason::Disconnected, now)
        {
            Some(removed) => {
                info!(
                    connection_id = %ctx.id,
                    subject_id = %removed.subject.id,
                    observers = removed.fan_out.delivered,
                    "subject stopped tracking"
                );
            }
            None => {
                debug!(connection_id = %ctx.id, subject_id, "stop-tracking for unknown or foreign subject");
            }
        }
    }

    /// Heartbeat: keeps this connection's subjects fresh and echoes the timestamp.
    pub fn on_ping(&self, ctx: &ConnectionContext, ping: Ping, now: u64) {
        self.registry.touch_connection(ctx.id, now);
        ctx.reply(ServerEvent::Pong(Pong {
            sent_at: ping.sent_at,
            server_time: now as i64,
        }));
    }

    pub fn on_disconnect(&self, ctx: &ConnectionContext, now: u64) {
        let departure = self.registry.depart_connection(ctx.id, now);
        counter!("tripteller_presence_connections_closed_total", 1);
        if departure.observer_removed || !departure.departed.is_empty() {
            info!(
                connection_id = %ctx.id,
                observer_removed = departure.observer_removed,
                subjects_departed = departure.departed.len(),
                "connection state released"
            );
        }
    }
}
