//! Event frames exchanged over the presence WebSocket.
//!
//! Every frame is a single JSON text message of the form
//! `{"event": "<kebab-case-name>", "data": <payload>}`. Payload fields are
//! camelCase. Timestamps are Unix epoch milliseconds.

use serde::{Deserialize, Serialize};

use crate::geo::{Coordinates, ValidationError};

/// Longest subject id accepted by the server.
pub const MAX_SUBJECT_ID_LEN: usize = 128;

/// Frames sent by mobile workers and admin dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinObserver(JoinObserver),
    LocationSample(LocationSample),
    StopTracking(StopTracking),
    Ping(Ping),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinObserver(_) => "join-observer",
            ClientEvent::LocationSample(_) => "location-sample",
            ClientEvent::StopTracking(_) => "stop-tracking",
            ClientEvent::Ping(_) => "ping",
        }
    }
}

/// Frames sent by the presence server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Connected(Connected),
    ObserverJoined(ObserverJoined),
    ObserverJoinRejected(Rejection),
    LocationAck(LocationAck),
    LocationRejected(Rejection),
    SubjectUpdate(SubjectUpdate),
    SubjectSnapshot(Vec<SubjectUpdate>),
    SubjectDeparted(SubjectDeparted),
    Pong(Pong),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected(_) => "connected",
            ServerEvent::ObserverJoined(_) => "observer-joined",
            ServerEvent::ObserverJoinRejected(_) => "observer-join-rejected",
            ServerEvent::LocationAck(_) => "location-ack",
            ServerEvent::LocationRejected(_) => "location-rejected",
            ServerEvent::SubjectUpdate(_) => "subject-update",
            ServerEvent::SubjectSnapshot(_) => "subject-snapshot",
            ServerEvent::SubjectDeparted(_) => "subject-departed",
            ServerEvent::Pong(_) => "pong",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinObserver {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub subject_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub captured_at: i64,
}

impl LocationSample {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }

    /// Checks the subject id and coordinates. Accuracy is advisory and never rejected.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let subject = self.subject_id.trim();
        if subject.is_empty() {
            return Err(ValidationError::MissingSubject);
        }
        if subject.chars().count() > MAX_SUBJECT_ID_LEN {
            return Err(ValidationError::SubjectTooLong(MAX_SUBJECT_ID_LEN));
        }
        self.coordinates().validate()
    }
}

/// Sent by a worker whose tracking ended deliberately (shift over, call finished).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTracking {
    pub subject_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    pub sent_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    pub connection_id: String,
    pub server_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserverJoined {
    pub success: bool,
    pub active_subject_count: usize,
    #[serde(default)]
    pub already_joined: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub reason: String,
}

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationAck {
    pub success: bool,
    pub observers_reached: usize,
}

/// Live position of one subject as seen by observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectUpdate {
    pub subject_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub captured_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepartureReason {
    Inactive,
    Disconnected,
}

impl DepartureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepartureReason::Inactive => "inactive",
            DepartureReason::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectDeparted {
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub reason: DepartureReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pong {
    pub sent_at: i64,
    pub server_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(subject: &str, lat: f64, lng: f64) -> LocationSample {
        LocationSample {
            subject_id: subject.into(),
            latitude: lat,
            longitude: lng,
            accuracy: Some(4.5),
            display_name: None,
            captured_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn location_sample_uses_kebab_event_and_camel_fields() {
        let frame = ClientEvent::LocationSample(sample("u1", 13.08, 80.27));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["event"], "location-sample");
        assert_eq!(value["data"]["subjectId"], "u1");
        assert_eq!(value["data"]["capturedAt"], 1_700_000_000_000i64);
        assert!(value["data"].get("displayName").is_none());
    }

    #[test]
    fn join_observer_accepts_missing_payload_fields() {
        let parsed: ClientEvent =
            serde_json::from_value(json!({"event": "join-observer", "data": {}})).unwrap();
        assert_eq!(parsed, ClientEvent::JoinObserver(JoinObserver::default()));
    }

    #[test]
    fn snapshot_serializes_as_array() {
        let update = SubjectUpdate {
            subject_id: "u1".into(),
            latitude: 1.0,
            longitude: 2.0,
            display_name: Some("Ravi".into()),
            captured_at: 5,
        };
        let value = serde_json::to_value(ServerEvent::SubjectSnapshot(vec![update])).unwrap();
        assert_eq!(value["event"], "subject-snapshot");
        assert_eq!(value["data"][0]["displayName"], "Ravi");
    }

    #[test]
    fn departure_reason_is_lowercase() {
        let value = serde_json::to_value(ServerEvent::SubjectDeparted(SubjectDeparted {
            subject_id: "u1".into(),
            display_name: None,
            reason: DepartureReason::Inactive,
        }))
        .unwrap();
        assert_eq!(value["data"]["reason"], "inactive");
    }

    #[test]
    fn departure_reason_is_inactive_or_disconnected() {
        let parsed: DepartureReason = serde_json::from_value(json!("disconnected")).unwrap();
        assert_eq!(parsed, DepartureReason::Disconnected);
        assert!(serde_json::from_value::<DepartureReason>(json!("stopped")).is_err());
    }

    #[test]
    fn stop_tracking_parses() {
        let parsed: ClientEvent = serde_json::from_value(
            json!({"event": "stop-tracking", "data": {"subjectId": "u7"}}),
        )
        .unwrap();
        assert_eq!(parsed.name(), "stop-tracking");
        assert_eq!(
            parsed,
            ClientEvent::StopTracking(StopTracking {
                subject_id: "u7".into()
            })
        );
    }

    #[test]
    fn sample_validation() {
        assert!(sample("u1", 13.08, 80.27).validate().is_ok());
        assert_eq!(
            sample("  ", 13.08, 80.27).validate(),
            Err(ValidationError::MissingSubject)
        );
        assert_eq!(
            sample(&"x".repeat(MAX_SUBJECT_ID_LEN + 1), 0.0, 0.0).validate(),
            Err(ValidationError::SubjectTooLong(MAX_SUBJECT_ID_LEN))
        );
        assert!(sample("u1", 91.0, 0.0).validate().is_err());
    }
}
