//! Primitives shared by the TripTeller presence server and its clients: the
//! event protocol spoken over the WebSocket, coordinate validation, and the
//! identity claims handed out by the auth service.

pub mod geo;
pub mod identity;
pub mod protocol;

pub use geo::{haversine_distance_m, Coordinates, ValidationError, EARTH_RADIUS_M};
pub use identity::{ClaimsDecodeError, IdentityClaims, Role, TokenValidationError};
pub use protocol::*;

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
