//! Backend row types: buses, trips and location records.
//!
//! Field names serialize to the backend's column names so rows can be decoded
//! straight out of realtime change payloads.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::position::Position;

/// Accuracy values above this (meters) are clamped before persisting.
pub const DEFAULT_MAX_ACCURACY_M: f64 = 999.99;

/// Operational status of a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusStatus {
    Active,
    #[default]
    Inactive,
    Maintenance,
}

impl BusStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusStatus::Active => "active",
            BusStatus::Inactive => "inactive",
            BusStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for BusStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BusStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(BusStatus::Active),
            "inactive" => Ok(BusStatus::Inactive),
            "maintenance" => Ok(BusStatus::Maintenance),
            other => Err(format!("unknown bus status '{}'", other)),
        }
    }
}

/// A bus as the backend stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusSnapshot {
    pub id: String,
    #[serde(rename = "bus_number")]
    pub number: String,
    pub route_name: String,
    #[serde(default)]
    pub status: BusStatus,
    #[serde(rename = "from_destination", default)]
    pub from: Option<String>,
    #[serde(rename = "to_destination", default)]
    pub to: Option<String>,
    /// Intermediate stops in travel order. Null in the backend means none.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub stops: Vec<String>,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub conductor_id: Option<String>,
}

impl BusSnapshot {
    pub fn new(
        id: impl Into<String>,
        number: impl Into<String>,
        route_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            number: number.into(),
            route_name: route_name.into(),
            status: BusStatus::Inactive,
            from: None,
            to: None,
            stops: Vec::new(),
            capacity: None,
            conductor_id: None,
        }
    }

    pub fn with_route<S: Into<String>>(
        mut self,
        from: impl Into<String>,
        stops: impl IntoIterator<Item = S>,
        to: impl Into<String>,
    ) -> Self {
        self.from = Some(from.into());
        self.stops = stops.into_iter().map(Into::into).collect();
        self.to = Some(to.into());
        self
    }

    pub fn with_status(mut self, status: BusStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// The full route: origin, intermediate stops, destination.
    ///
    /// Missing endpoints appear as empty strings so stop positions stay
    /// stable.
    pub fn complete_route(&self) -> Vec<&str> {
        std::iter::once(self.from.as_deref().unwrap_or(""))
            .chain(self.stops.iter().map(String::as_str))
            .chain(std::iter::once(self.to.as_deref().unwrap_or("")))
            .collect()
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A trip: the interval during which a conductor broadcasts a bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: String,
    pub bus_id: String,
    pub conductor_id: String,
    pub started_at: Timestamp,
    #[serde(default)]
    pub ended_at: Option<Timestamp>,
    pub is_active: bool,
}

/// One persisted location ping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub bus_id: String,
    #[serde(default)]
    pub trip_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    /// Ground speed in m/s; zero when the device did not report one.
    #[serde(default, deserialize_with = "null_as_zero")]
    pub speed: f64,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(rename = "timestamp")]
    pub recorded_at: Timestamp,
}

fn null_as_zero<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(0.0))
}

impl LocationRecord {
    /// Build the record persisted for an accepted fix.
    ///
    /// Accuracy is clamped to `max_accuracy_m` (and dropped when not finite),
    /// a missing speed becomes zero, heading passes through.
    pub fn from_position(
        bus_id: impl Into<String>,
        trip_id: Option<String>,
        position: &Position,
        max_accuracy_m: f64,
        recorded_at: Timestamp,
    ) -> Self {
        Self {
            bus_id: bus_id.into(),
            trip_id,
            latitude: position.latitude,
            longitude: position.longitude,
            accuracy: position
                .accuracy
                .filter(|a| a.is_finite())
                .map(|a| a.min(max_accuracy_m)),
            speed: position.speed.unwrap_or(0.0),
            heading: position.heading,
            recorded_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::timestamp_from_millis;

    #[test]
    fn test_record_from_position_clamps_and_defaults() {
        let position = Position::new(10.0, 20.0, timestamp_from_millis(0))
            .with_accuracy(5_000.0)
            .with_heading(90.0);

        let record = LocationRecord::from_position(
            "B1",
            Some("T1".into()),
            &position,
            DEFAULT_MAX_ACCURACY_M,
            timestamp_from_millis(42),
        );

        assert_eq!(record.bus_id, "B1");
        assert_eq!(record.trip_id.as_deref(), Some("T1"));
        assert_eq!(record.accuracy, Some(999.99));
        assert_eq!(record.speed, 0.0);
        assert_eq!(record.heading, Some(90.0));
        assert_eq!(record.recorded_at.timestamp_millis(), 42);
    }

    #[test]
    fn test_record_drops_non_finite_accuracy() {
        let position =
            Position::new(0.0, 0.0, timestamp_from_millis(0)).with_accuracy(f64::NAN);
        let record =
            LocationRecord::from_position("B1", None, &position, 100.0, timestamp_from_millis(0));
        assert_eq!(record.accuracy, None);
    }

    #[test]
    fn test_complete_route_keeps_order() {
        let bus = BusSnapshot::new("b", "12", "Downtown").with_route("A", ["B"], "C");
        assert_eq!(bus.complete_route(), vec!["A", "B", "C"]);

        let bare = BusSnapshot::new("b", "12", "Downtown");
        assert_eq!(bare.complete_route(), vec!["", ""]);
    }

    #[test]
    fn test_bus_decodes_backend_row() {
        let json = r#"{
            "id": "b-1",
            "bus_number": "42",
            "route_name": "Harbor Loop",
            "status": "maintenance",
            "from_destination": "Depot",
            "to_destination": null,
            "stops": null,
            "capacity": 60,
            "conductor_id": null,
            "created_at": "2024-01-01T00:00:00Z"
        }"#;

        let bus: BusSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(bus.number, "42");
        assert_eq!(bus.status, BusStatus::Maintenance);
        assert_eq!(bus.from.as_deref(), Some("Depot"));
        assert!(bus.to.is_none());
        assert!(bus.stops.is_empty());
        assert_eq!(bus.capacity, Some(60));
    }

    #[test]
    fn test_location_decodes_null_speed() {
        let json = r#"{
            "bus_id": "b-1",
            "trip_id": null,
            "latitude": 1.5,
            "longitude": 2.5,
            "speed": null,
            "timestamp": "2024-01-01T00:00:05Z"
        }"#;

        let record: LocationRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.speed, 0.0);
        assert_eq!(record.recorded_at.timestamp(), 1_704_067_205);
    }

    #[test]
    fn test_bus_status_parse() {
        assert_eq!("Active".parse::<BusStatus>(), Ok(BusStatus::Active));
        assert!("retired".parse::<BusStatus>().is_err());
    }
}
