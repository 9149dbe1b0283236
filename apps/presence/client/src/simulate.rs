//! Synthetic position source for demos and load runs.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;
use tripteller_presence_core::{now_millis, EARTH_RADIUS_M};

use crate::sampler::{Fix, Permission, PositionError, PositionSource};

/// Walks a straight line from `origin` at a fixed speed and bearing, emitting
/// one fix per `period`.
#[derive(Debug, Clone)]
pub struct WalkingSource {
    latitude: f64,
    longitude: f64,
    bearing_deg: f64,
    speed_mps: f64,
    period: Duration,
    remaining: Option<u64>,
    /// Radius of the random accuracy reported with each fix.
    noise_m: f64,
}

impl WalkingSource {
    pub fn new(latitude: f64, longitude: f64, speed_mps: f64, period: Duration) -> Self {
        Self {
            latitude,
            longitude,
            bearing_deg: 0.0,
            speed_mps,
            period,
            remaining: None,
            noise_m: 8.0,
        }
    }

    pub fn bearing(mut self, degrees: f64) -> Self {
        self.bearing_deg = degrees;
        self
    }

    pub fn steps(mut self, steps: u64) -> Self {
        self.remaining = Some(steps);
        self
    }

    fn advance(&mut self) {
        let step_m = self.speed_mps * self.period.as_secs_f64();
        let bearing = self.bearing_deg.to_radians();
        let d_lat = step_m * bearing.cos() / EARTH_RADIUS_M;
        let d_lng =
            step_m * bearing.sin() / (EARTH_RADIUS_M * self.latitude.to_radians().cos().max(1e-6));
        self.latitude = (self.latitude + d_lat.to_degrees()).clamp(-90.0, 90.0);
        self.longitude += d_lng.to_degrees();
        if self.longitude > 180.0 {
            self.longitude -= 360.0;
        } else if self.longitude < -180.0 {
            self.longitude += 360.0;
        }
    }
}

#[async_trait]
impl PositionSource for WalkingSource {
    async fn permission(&mut self) -> Permission {
        Permission::Granted
    }

    async fn next_fix(&mut self) -> Result<Fix, PositionError> {
        match self.remaining {
            Some(0) => return Err(PositionError::Ended),
            Some(ref mut left) => *left -= 1,
            None => {}
        }
        sleep(self.period).await;
        self.advance();
        let accuracy = rand::thread_rng().gen_range(2.0..=self.noise_m.max(2.0));
        Ok(Fix::new(self.latitude, self.longitude, now_millis()).with_accuracy(accuracy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tripteller_presence_core::{haversine_distance_m, Coordinates};

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn walks_the_configured_distance() {
        let mut source = WalkingSource::new(13.0, 80.0, 1.5, Duration::from_secs(4))
            .bearing(90.0)
            .steps(2);
        let start = Coordinates::new(13.0, 80.0);

        let first = source.next_fix().await.unwrap();
        let moved = haversine_distance_m(&start, &first.coordinates);
        assert!((moved - 6.0).abs() < 0.05, "moved {moved}");
        assert!(first.coordinates.longitude > 80.0);

        source.next_fix().await.unwrap();
        assert_eq!(source.next_fix().await, Err(PositionError::Ended));
    }
}
