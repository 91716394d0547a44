//! Device position fixes and the errors a location capability can report.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Timestamp;

/// Highest speed (km/h) accepted as plausible for a bus.
pub const MAX_REASONABLE_SPEED_KMH: f64 = 200.0;

/// A single position fix from the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in degrees, `[-90, 90]`.
    pub latitude: f64,
    /// Longitude in degrees, `[-180, 180]`.
    pub longitude: f64,
    /// Horizontal accuracy radius in meters.
    #[serde(default)]
    pub accuracy: Option<f64>,
    /// Ground speed in m/s.
    #[serde(default)]
    pub speed: Option<f64>,
    /// Direction of travel in degrees clockwise from north, `[0, 360)`.
    #[serde(default)]
    pub heading: Option<f64>,
    /// When the device captured the fix.
    pub captured_at: Timestamp,
}

impl Position {
    /// Create a fix with only coordinates.
    pub fn new(latitude: f64, longitude: f64, captured_at: Timestamp) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
            speed: None,
            heading: None,
            captured_at,
        }
    }

    pub fn with_accuracy(mut self, meters: f64) -> Self {
        self.accuracy = Some(meters);
        self
    }

    pub fn with_speed(mut self, meters_per_second: f64) -> Self {
        self.speed = Some(meters_per_second);
        self
    }

    pub fn with_heading(mut self, degrees: f64) -> Self {
        self.heading = Some(degrees);
        self
    }

    /// Bring a raw fix into the documented value ranges.
    ///
    /// Coordinates out of range mean the device has no usable fix, which is
    /// reported as [`PositionError::PositionUnavailable`]. Optional fields that
    /// are non-finite or negative are dropped; heading is wrapped into
    /// `[0, 360)`.
    pub fn normalize(self) -> Result<Self, PositionError> {
        if !validate_coordinates(self.latitude, self.longitude) {
            return Err(PositionError::PositionUnavailable);
        }

        let non_negative = |v: Option<f64>| v.filter(|x| x.is_finite() && *x >= 0.0);

        Ok(Self {
            accuracy: non_negative(self.accuracy),
            speed: non_negative(self.speed),
            heading: self
                .heading
                .filter(|h| h.is_finite())
                .map(normalize_heading),
            ..self
        })
    }

    /// Speed converted to km/h, zero when unknown.
    pub fn speed_kmh(&self) -> f64 {
        self.speed.unwrap_or(0.0) * 3.6
    }
}

/// Wrap a heading into `[0, 360)`.
///
/// `rem_euclid` rounds tiny negative inputs up to exactly 360.
fn normalize_heading(degrees: f64) -> f64 {
    let wrapped = degrees.rem_euclid(360.0);
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Check that a coordinate pair lies on the globe.
pub fn validate_coordinates(latitude: f64, longitude: f64) -> bool {
    (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude)
}

/// Check that a speed in km/h is plausible for a road vehicle.
pub fn validate_speed(speed_kmh: f64) -> bool {
    (0.0..=MAX_REASONABLE_SPEED_KMH).contains(&speed_kmh)
}

/// Failures a location capability can surface.
///
/// None of these are retried internally; retry policy belongs to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PositionError {
    /// The user or platform refused location access.
    #[error("Location access denied. Please enable location permissions in your device settings.")]
    PermissionDenied,

    /// The device could not determine a position.
    #[error("Location information unavailable. Please check your GPS settings.")]
    PositionUnavailable,

    /// No fix arrived within the configured timeout.
    #[error("Location request timed out. Please try again.")]
    Timeout,

    /// The device has no location capability at all.
    #[error("Geolocation is not supported by this device.")]
    Unsupported,
}

impl PositionError {
    /// Short heading used when the error is shown as a notification.
    pub fn title(&self) -> &'static str {
        match self {
            PositionError::Unsupported => "Geolocation Not Supported",
            _ => "Location Error",
        }
    }
}
