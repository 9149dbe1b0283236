use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Returns `Ok(())` when both components are finite and inside the WGS84 range.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.latitude.is_finite() || !self.longitude.is_finite() {
            return Err(ValidationError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ValidationError::LatitudeOutOfRange(self.latitude));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ValidationError::LongitudeOutOfRange(self.longitude));
        }
        Ok(())
    }

    pub fn distance_to(&self, other: &Coordinates) -> f64 {
        haversine_distance_m(self, other)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("coordinates must be finite numbers")]
    NonFinite,
    #[error("latitude {0} outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} outside [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("subject id missing")]
    MissingSubject,
    #[error("subject id longer than {0} characters")]
    SubjectTooLong(usize),
}

impl ValidationError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ValidationError::NonFinite => "non_finite",
            ValidationError::LatitudeOutOfRange(_) => "latitude_range",
            ValidationError::LongitudeOutOfRange(_) => "longitude_range",
            ValidationError::MissingSubject => "missing_subject",
            ValidationError::SubjectTooLong(_) => "subject_too_long",
        }
    }
}

/// Great-circle distance in metres between two points.
pub fn haversine_distance_m(a: &Coordinates, b: &Coordinates) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_for_identical_points() {
        let p = Coordinates::new(13.08, 80.27);
        assert_eq!(haversine_distance_m(&p, &p), 0.0);
    }

    #[test]
    fn one_degree_of_latitude_is_about_111km() {
        let a = Coordinates::new(0.0, 0.0);
        let b = Coordinates::new(1.0, 0.0);
        let d = haversine_distance_m(&a, &b);
        assert!((d - 111_194.9).abs() < 1.0, "got {d}");
    }

    #[test]
    fn distance_is_symmetric() {
        let a = Coordinates::new(13.0827, 80.2707);
        let b = Coordinates::new(12.9716, 77.5946);
        let ab = a.distance_to(&b);
        let ba = b.distance_to(&a);
        assert!((ab - ba).abs() < 1e-6);
    }

    #[test]
    fn rejects_invalid_coordinates() {
        assert_eq!(
            Coordinates::new(f64::NAN, 0.0).validate(),
            Err(ValidationError::NonFinite)
        );
        assert_eq!(
            Coordinates::new(0.0, f64::INFINITY).validate(),
            Err(ValidationError::NonFinite)
        );
        assert!(matches!(
            Coordinates::new(90.5, 0.0).validate(),
            Err(ValidationError::LatitudeOutOfRange(_))
        ));
        assert!(matches!(
            Coordinates::new(0.0, -180.01).validate(),
            Err(ValidationError::LongitudeOutOfRange(_))
        ));
        assert!(Coordinates::new(-90.0, 180.0).validate().is_ok());
    }
}
