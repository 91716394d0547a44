//! Persistence collaborator.
//!
//! All durable state lives in an external backend. The core talks to it
//! through [`TransitStore`], which covers exactly the operations the tracking
//! flow needs: append a location, open and close trips, flip bus status, and
//! read the latest location of a bus. Historical trajectories are never
//! queried.
//!
//! # Dyn Compatibility
//!
//! Methods return [`BoxFuture`] so the store can be shared as
//! `Arc<dyn TransitStore>` between the tracking session, the trip controller
//! and the passenger live view.

mod memory;

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::clock::Timestamp;
use crate::model::{BusSnapshot, BusStatus, LocationRecord, Trip};

pub use memory::MemoryStore;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors reported by the persistence backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backend rejected an insert or update.
    #[error("Write to {table} failed: {reason}")]
    WriteFailed { table: &'static str, reason: String },

    /// The referenced row does not exist.
    #[error("{table} row {id} not found")]
    NotFound { table: &'static str, id: String },

    /// The backend could not be reached.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Change to apply to a bus row.
#[derive(Debug, Clone, PartialEq)]
pub struct BusUpdate {
    pub status: BusStatus,
    /// `Some` assigns the conductor; `None` leaves the column unchanged.
    pub conductor_id: Option<String>,
}

impl BusUpdate {
    pub fn status(status: BusStatus) -> Self {
        Self {
            status,
            conductor_id: None,
        }
    }

    pub fn assign(status: BusStatus, conductor_id: impl Into<String>) -> Self {
        Self {
            status,
            conductor_id: Some(conductor_id.into()),
        }
    }
}

/// Which buses to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusFilter {
    #[default]
    All,
    ActiveOnly,
}

/// Backend operations used by the tracking core.
pub trait TransitStore: Send + Sync {
    /// Append a location record.
    fn insert_location(&self, record: LocationRecord) -> BoxFuture<'_, StoreResult<()>>;

    /// Open a new active trip and return it.
    fn insert_trip(
        &self,
        bus_id: &str,
        conductor_id: &str,
        started_at: Timestamp,
    ) -> BoxFuture<'_, StoreResult<Trip>>;

    /// Mark a trip as ended.
    fn end_trip(&self, trip_id: &str, ended_at: Timestamp) -> BoxFuture<'_, StoreResult<()>>;

    /// Update a bus's status and, optionally, its conductor.
    fn update_bus(&self, bus_id: &str, update: BusUpdate) -> BoxFuture<'_, StoreResult<()>>;

    /// Fetch one bus.
    fn get_bus(&self, bus_id: &str) -> BoxFuture<'_, StoreResult<Option<BusSnapshot>>>;

    /// List buses ordered by bus number.
    fn list_buses(&self, filter: BusFilter) -> BoxFuture<'_, StoreResult<Vec<BusSnapshot>>>;

    /// Newest location record for a bus, by `recorded_at`.
    fn latest_location(&self, bus_id: &str)
        -> BoxFuture<'_, StoreResult<Option<LocationRecord>>>;
}
