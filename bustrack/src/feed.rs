//! Realtime change feed.
//!
//! The backend pushes a change event for every insert, update or delete on
//! the `buses` and `bus_locations` tables. Subscribers receive them as
//! [`FeedEvent`]s over a tokio broadcast channel; a dropped subscription is
//! surfaced as [`FeedEvent::SubscriptionDropped`] so consumers can keep their
//! last known state until the feed collaborator resubscribes.
//!
//! Wire payloads look like:
//!
//! ```json
//! { "table": "bus_locations", "eventType": "INSERT", "new": { "bus_id": "...", ... } }
//! ```

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{BusSnapshot, LocationRecord};

/// Tables the feed reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Buses,
    BusLocations,
}

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// The new state of a changed row.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeRow {
    Bus(BusSnapshot),
    Location(LocationRecord),
}

/// One row change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub operation: Operation,
    /// Absent for deletes.
    pub new_row: Option<ChangeRow>,
}

impl ChangeEvent {
    pub fn location_inserted(record: LocationRecord) -> Self {
        Self {
            table: Table::BusLocations,
            operation: Operation::Insert,
            new_row: Some(ChangeRow::Location(record)),
        }
    }

    pub fn bus_updated(bus: BusSnapshot) -> Self {
        Self {
            table: Table::Buses,
            operation: Operation::Update,
            new_row: Some(ChangeRow::Bus(bus)),
        }
    }

    /// Bus id the changed row belongs to, if there is a row.
    pub fn bus_id(&self) -> Option<&str> {
        match &self.new_row {
            Some(ChangeRow::Bus(bus)) => Some(&bus.id),
            Some(ChangeRow::Location(record)) => Some(&record.bus_id),
            None => None,
        }
    }

    /// Decode a backend change payload.
    pub fn from_json(payload: &str) -> Result<Self, FeedError> {
        let raw: RawPayload = serde_json::from_str(payload)?;

        let new_row = match raw.new {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::Object(map)) if map.is_empty() => None,
            Some(value) => Some(match raw.table {
                Table::Buses => ChangeRow::Bus(serde_json::from_value(value)?),
                Table::BusLocations => ChangeRow::Location(serde_json::from_value(value)?),
            }),
        };

        if new_row.is_none() && raw.event_type != Operation::Delete {
            return Err(FeedError::MissingRow {
                operation: raw.event_type,
            });
        }

        Ok(Self {
            table: raw.table,
            operation: raw.event_type,
            new_row,
        })
    }
}

#[derive(Deserialize)]
struct RawPayload {
    table: Table,
    #[serde(rename = "eventType")]
    event_type: Operation,
    #[serde(default)]
    new: Option<serde_json::Value>,
}

/// What a feed subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Change(ChangeEvent),
    /// The subscription was lost; the feed collaborator resubscribes.
    SubscriptionDropped,
}

/// Errors decoding feed payloads.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Malformed change payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{operation:?} event carried no row")]
    MissingRow { operation: Operation },
}

/// Source of realtime change events.
pub trait RealtimeFeed: Send + Sync {
    /// Subscribe to all subsequent change events.
    fn subscribe(&self) -> broadcast::Receiver<FeedEvent>;
}
