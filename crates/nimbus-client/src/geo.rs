//! Latitude/longitude points for geo fields and geo queries.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{ErrorCode, NimbusError};

/// Mean earth radius used for distance conversions.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Mean earth radius used for distance conversions.
pub const EARTH_RADIUS_MILES: f64 = 3958.8;

/// A point on the globe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__type", rename = "GeoPoint", try_from = "RawGeoPoint")]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

/// Wire form, checked by [`GeoPoint::new`] before use.
#[derive(Deserialize)]
#[serde(tag = "__type", rename = "GeoPoint")]
struct RawGeoPoint {
    latitude: f64,
    longitude: f64,
}

impl TryFrom<RawGeoPoint> for GeoPoint {
    type Error = NimbusError;

    fn try_from(raw: RawGeoPoint) -> Result<Self, Self::Error> {
        GeoPoint::new(raw.latitude, raw.longitude)
    }
}

impl Default for GeoPoint {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
        }
    }
}

impl GeoPoint {
    /// Create a point, rejecting out-of-range coordinates.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, NimbusError> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(NimbusError::invalid(
                ErrorCode::IncorrectType,
                format!("latitude {latitude} is outside [-90, 90]"),
            ));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(NimbusError::invalid(
                ErrorCode::IncorrectType,
                format!("longitude {longitude} is outside [-180, 180]"),
            ));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Great-circle distance in radians (haversine).
    pub fn radians_to(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let delta_lat = (other.latitude - self.latitude).to_radians();
        let delta_lon = (other.longitude - self.longitude).to_radians();

        let sin_lat = (delta_lat / 2.0).sin();
        let sin_lon = (delta_lon / 2.0).sin();
        let a = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lon * sin_lon;
        2.0 * a.sqrt().min(1.0).asin()
    }

    pub fn kilometers_to(&self, other: &GeoPoint) -> f64 {
        self.radians_to(other) * EARTH_RADIUS_KM
    }

    pub fn miles_to(&self, other: &GeoPoint) -> f64 {
        self.radians_to(other) * EARTH_RADIUS_MILES
    }
}

impl From<GeoPoint> for Value {
    fn from(point: GeoPoint) -> Self {
        json!({
            "__type": "GeoPoint",
            "latitude": point.latitude,
            "longitude": point.longitude,
        })
    }
}
