use serde::{Deserialize, Serialize};

use crate::EngineError;

pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;
// Relative widening of the search window so float rounding never clips the radius edge.
const WINDOW_PADDING: f64 = 1e-3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Axis-aligned search window in degrees. `lon_wraps` is set when the window crosses the
/// antimeridian or a pole, in which case callers must not filter on longitude.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
    pub lon_wraps: bool,
}

impl GeoPoint {
    #[must_use]
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Check the coordinate is finite and inside WGS84 bounds.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for NaN/infinite or out-of-range coordinates.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.lat.is_finite() || !self.lon.is_finite() {
            return Err(EngineError::Validation("coordinates MUST be finite numbers".to_string()));
        }
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(EngineError::Validation(format!(
                "latitude {} MUST be within [-90, 90]",
                self.lat
            )));
        }
        if !(-180.0..=180.0).contains(&self.lon) {
            return Err(EngineError::Validation(format!(
                "longitude {} MUST be within [-180, 180]",
                self.lon
            )));
        }
        Ok(())
    }

    /// Great-circle distance in meters (haversine).
    #[must_use]
    pub fn distance_meters(&self, other: &GeoPoint) -> f64 {
        let phi1 = self.lat.to_radians();
        let phi2 = other.lat.to_radians();
        let delta_phi = (other.lat - self.lat).to_radians();
        let delta_lambda = (other.lon - self.lon).to_radians();

        let a = (delta_phi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_METERS * c
    }

    /// Degree window that contains every point within `radius_meters` great-circle distance
    /// of `self`, on the same sphere [`GeoPoint::distance_meters`] measures on.
    #[must_use]
    pub fn bounding_box(&self, radius_meters: f64) -> BoundingBox {
        let angular = radius_meters.max(0.0) * (1.0 + WINDOW_PADDING) / EARTH_RADIUS_METERS;
        let delta_lat = angular.to_degrees();
        let min_lat = self.lat - delta_lat;
        let max_lat = self.lat + delta_lat;

        // Widest longitude offset of the circle sits poleward of the center, not on its parallel.
        // With both latitude edges off the poles, sin(angular) < cos(lat) and asin stays defined.
        let near_pole = min_lat <= -90.0 || max_lat >= 90.0;
        let delta_lon = if near_pole {
            180.0
        } else {
            (angular.sin() / self.lat.to_radians().cos()).asin().to_degrees()
        };
        let min_lon = self.lon - delta_lon;
        let max_lon = self.lon + delta_lon;

        BoundingBox {
            min_lat: min_lat.max(-90.0),
            max_lat: max_lat.min(90.0),
            min_lon,
            max_lon,
            lon_wraps: near_pole || min_lon < -180.0 || max_lon > 180.0,
        }
    }
}
