//! In-process transit store.
//!
//! Keeps buses, trips and location records in memory and broadcasts a
//! [`FeedEvent`] for every change, standing in for the hosted backend and its
//! realtime feed. Used by the CLI replay command and by tests.
//!
//! Write failures can be injected with [`MemoryStore::set_fail_writes`] to
//! exercise the error paths of the tracking flow.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::{BoxFuture, BusFilter, BusUpdate, StoreError, StoreResult, TransitStore};
use crate::clock::Timestamp;
use crate::feed::{ChangeEvent, ChangeRow, FeedEvent, Operation, RealtimeFeed, Table};
use crate::model::{BusSnapshot, BusStatus, LocationRecord, Trip};

/// Capacity of the change broadcast channel.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Tables {
    buses: BTreeMap<String, BusSnapshot>,
    trips: HashMap<String, Trip>,
    locations: Vec<LocationRecord>,
}

/// Memory-backed [`TransitStore`] with a realtime feed.
#[derive(Debug)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    next_trip: AtomicU64,
    fail_writes: AtomicBool,
    feed: broadcast::Sender<FeedEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(DEFAULT_FEED_CAPACITY);
        Self {
            tables: RwLock::new(Tables::default()),
            next_trip: AtomicU64::new(1),
            fail_writes: AtomicBool::new(false),
            feed,
        }
    }

    /// Create a store seeded with buses.
    pub fn with_buses(buses: impl IntoIterator<Item = BusSnapshot>) -> Self {
        let store = Self::new();
        {
            let mut tables = store.tables.write();
            for bus in buses {
                tables.buses.insert(bus.id.clone(), bus);
            }
        }
        store
    }

    /// Insert or replace a bus row.
    pub fn upsert_bus(&self, bus: BusSnapshot) {
        let existed = self
            .tables
            .write()
            .buses
            .insert(bus.id.clone(), bus.clone())
            .is_some();
        let operation = if existed {
            Operation::Update
        } else {
            Operation::Insert
        };
        self.publish(ChangeEvent {
            table: Table::Buses,
            operation,
            new_row: Some(ChangeRow::Bus(bus)),
        });
    }

    /// Make every subsequent write fail with `WriteFailed`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Tell every subscriber its subscription dropped.
    pub fn drop_subscriptions(&self) {
        let _ = self.feed.send(FeedEvent::SubscriptionDropped);
    }

    /// All location records in insertion order.
    pub fn locations(&self) -> Vec<LocationRecord> {
        self.tables.read().locations.clone()
    }

    pub fn location_count(&self) -> usize {
        self.tables.read().locations.len()
    }

    pub fn trip(&self, trip_id: &str) -> Option<Trip> {
        self.tables.read().trips.get(trip_id).cloned()
    }

    pub fn bus(&self, bus_id: &str) -> Option<BusSnapshot> {
        self.tables.read().buses.get(bus_id).cloned()
    }

    fn check_writable(&self, table: &'static str) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteFailed {
                table,
                reason: "write rejected by backend".to_string(),
            });
        }
        Ok(())
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscribers is not an error.
        let _ = self.feed.send(FeedEvent::Change(event));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeFeed for MemoryStore {
    fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.feed.subscribe()
    }
}

impl TransitStore for MemoryStore {
    fn insert_location(&self, record: LocationRecord) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            self.check_writable("bus_locations")?;
            {
                let mut tables = self.tables.write();
                if !tables.buses.contains_key(&record.bus_id) {
                    return Err(StoreError::NotFound {
                        table: "buses",
                        id: record.bus_id,
                    });
                }
                tables.locations.push(record.clone());
            }
            trace!(bus_id = %record.bus_id, "Location inserted");
            self.publish(ChangeEvent::location_inserted(record));
            Ok(())
        })
    }

    fn insert_trip(
        &self,
        bus_id: &str,
        conductor_id: &str,
        started_at: Timestamp,
    ) -> BoxFuture<'_, StoreResult<Trip>> {
        let bus_id = bus_id.to_string();
        let conductor_id = conductor_id.to_string();
        Box::pin(async move {
            self.check_writable("trips")?;
            let mut tables = self.tables.write();
            if !tables.buses.contains_key(&bus_id) {
                return Err(StoreError::NotFound {
                    table: "buses",
                    id: bus_id,
                });
            }

            let trip = Trip {
                id: format!("trip-{}", self.next_trip.fetch_add(1, Ordering::Relaxed)),
                bus_id,
                conductor_id,
                started_at,
                ended_at: None,
                is_active: true,
            };
            tables.trips.insert(trip.id.clone(), trip.clone());
            debug!(trip_id = %trip.id, bus_id = %trip.bus_id, "Trip inserted");
            Ok(trip)
        })
    }

    fn end_trip(&self, trip_id: &str, ended_at: Timestamp) -> BoxFuture<'_, StoreResult<()>> {
        let trip_id = trip_id.to_string();
        Box::pin(async move {
            self.check_writable("trips")?;
            let mut tables = self.tables.write();
            let trip = tables.trips.get_mut(&trip_id).ok_or(StoreError::NotFound {
                table: "trips",
                id: trip_id.clone(),
            })?;
            trip.ended_at = Some(ended_at);
            trip.is_active = false;
            debug!(trip_id = %trip_id, "Trip ended");
            Ok(())
        })
    }

    fn update_bus(&self, bus_id: &str, update: BusUpdate) -> BoxFuture<'_, StoreResult<()>> {
        let bus_id = bus_id.to_string();
        Box::pin(async move {
            self.check_writable("buses")?;
            let updated = {
                let mut tables = self.tables.write();
                let bus = tables.buses.get_mut(&bus_id).ok_or(StoreError::NotFound {
                    table: "buses",
                    id: bus_id.clone(),
                })?;
                bus.status = update.status;
                if let Some(conductor_id) = update.conductor_id {
                    bus.conductor_id = Some(conductor_id);
                }
                bus.clone()
            };
            self.publish(ChangeEvent::bus_updated(updated));
            Ok(())
        })
    }

    fn get_bus(&self, bus_id: &str) -> BoxFuture<'_, StoreResult<Option<BusSnapshot>>> {
        let bus_id = bus_id.to_string();
        Box::pin(async move { Ok(self.bus(&bus_id)) })
    }

    fn list_buses(&self, filter: BusFilter) -> BoxFuture<'_, StoreResult<Vec<BusSnapshot>>> {
        Box::pin(async move {
            let tables = self.tables.read();
            let mut buses: Vec<BusSnapshot> = tables
                .buses
                .values()
                .filter(|bus| filter == BusFilter::All || bus.status == BusStatus::Active)
                .cloned()
                .collect();
            buses.sort_by(|a, b| a.number.cmp(&b.number));
            Ok(buses)
        })
    }

    fn latest_location(
        &self,
        bus_id: &str,
    ) -> BoxFuture<'_, StoreResult<Option<LocationRecord>>> {
        let bus_id = bus_id.to_string();
        Box::pin(async move {
            let tables = self.tables.read();
            Ok(tables
                .locations
                .iter()
                .filter(|record| record.bus_id == bus_id)
                .max_by_key(|record| record.recorded_at)
                .cloned())
        })
    }
}
