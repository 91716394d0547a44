//! Passenger live view.
//!
//! Tracks the displayed location of the bus a passenger selected. Two sources
//! feed it: a one-off fetch of the latest stored location when the bus is
//! selected, and realtime change events pushed by the backend. They can arrive
//! in any order, so every location is compared by `recorded_at` and the newest
//! one wins.
//!
//! All mutation goes through [`LiveView::apply`]. [`LiveViewService`] runs a
//! view on its own task, turning commands, fetch results and feed events into
//! [`LiveViewMessage`]s and publishing a [`LiveViewSnapshot`] after each one.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::clock::Timestamp;
use crate::feed::{ChangeRow, FeedEvent, RealtimeFeed};
use crate::model::{BusSnapshot, BusStatus, LocationRecord};
use crate::store::{StoreError, TransitStore};

/// What the map should show for the selected bus.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DisplayState {
    /// No bus selected.
    #[default]
    NoSelection,
    /// Bus selected, initial fetch outstanding and nothing pushed yet.
    Loading,
    /// The bus has no location history. Not an error.
    NoData,
    /// Newest known location.
    Located(LocationRecord),
    /// The initial fetch failed and nothing has been pushed since.
    Error(String),
}

impl DisplayState {
    pub fn location(&self) -> Option<&LocationRecord> {
        match self {
            DisplayState::Located(record) => Some(record),
            _ => None,
        }
    }
}

/// Input to [`LiveView::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum LiveViewMessage {
    /// The passenger picked a bus.
    SelectBus(BusSnapshot),
    /// The passenger closed the view.
    ClearSelection,
    /// The latest stored location for `bus_id` came back.
    InitialFetch {
        bus_id: String,
        result: Result<Option<LocationRecord>, StoreError>,
    },
    /// Something arrived on the realtime feed.
    Feed(FeedEvent),
}

/// Marker handed to the map renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct MapMarker {
    pub bus_id: String,
    pub bus_number: String,
    pub latitude: f64,
    pub longitude: f64,
    pub heading: Option<f64>,
    pub status: BusStatus,
    pub recorded_at: Timestamp,
}

/// Reconciled view of one selected bus.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveView {
    bus: Option<BusSnapshot>,
    state: DisplayState,
    feed_connected: bool,
}

impl Default for LiveView {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveView {
    pub fn new() -> Self {
        Self {
            bus: None,
            state: DisplayState::NoSelection,
            feed_connected: true,
        }
    }

    pub fn bus(&self) -> Option<&BusSnapshot> {
        self.bus.as_ref()
    }

    pub fn selected_bus_id(&self) -> Option<&str> {
        self.bus.as_ref().map(|bus| bus.id.as_str())
    }

    pub fn state(&self) -> &DisplayState {
        &self.state
    }

    /// `false` after the feed reported a dropped subscription and before the
    /// next event arrived.
    pub fn feed_connected(&self) -> bool {
        self.feed_connected
    }

    /// Marker for the map, present only while a location is held.
    pub fn marker(&self) -> Option<MapMarker> {
        let bus = self.bus.as_ref()?;
        let record = self.state.location()?;
        Some(MapMarker {
            bus_id: bus.id.clone(),
            bus_number: bus.number.clone(),
            latitude: record.latitude,
            longitude: record.longitude,
            heading: record.heading,
            status: bus.status,
            recorded_at: record.recorded_at,
        })
    }

    /// Apply one message. Returns `true` if anything visible changed.
    pub fn apply(&mut self, message: LiveViewMessage) -> bool {
        match message {
            LiveViewMessage::SelectBus(bus) => self.select(bus),
            LiveViewMessage::ClearSelection => {
                let changed = self.bus.is_some();
                self.bus = None;
                self.state = DisplayState::NoSelection;
                changed
            }
            LiveViewMessage::InitialFetch { bus_id, result } => self.apply_fetch(&bus_id, result),
            LiveViewMessage::Feed(FeedEvent::SubscriptionDropped) => {
                warn!(bus_id = ?self.selected_bus_id(), "Feed subscription dropped, keeping last location");
                std::mem::replace(&mut self.feed_connected, false)
            }
            LiveViewMessage::Feed(FeedEvent::Change(event)) => {
                let reconnected = !std::mem::replace(&mut self.feed_connected, true);
                let changed = match event.new_row {
                    Some(ChangeRow::Location(record)) => self.apply_location(record),
                    Some(ChangeRow::Bus(bus)) => self.apply_bus(bus),
                    None => false,
                };
                changed || reconnected
            }
        }
    }

    fn select(&mut self, bus: BusSnapshot) -> bool {
        if self.selected_bus_id() == Some(bus.id.as_str()) {
            let changed = self.bus.as_ref() != Some(&bus);
            self.bus = Some(bus);
            return changed;
        }

        debug!(bus_id = %bus.id, "Bus selected");
        self.bus = Some(bus);
        self.state = DisplayState::Loading;
        true
    }

    fn apply_fetch(
        &mut self,
        bus_id: &str,
        result: Result<Option<LocationRecord>, StoreError>,
    ) -> bool {
        if self.selected_bus_id() != Some(bus_id) {
            trace!(bus_id, "Ignoring fetch for unselected bus");
            return false;
        }

        match result {
            Ok(Some(record)) => self.apply_location(record),
            Ok(None) => match self.state {
                DisplayState::Loading | DisplayState::Error(_) => {
                    self.state = DisplayState::NoData;
                    true
                }
                _ => false,
            },
            Err(e) => {
                warn!(bus_id, error = %e, "Failed to fetch latest location");
                match self.state {
                    DisplayState::Loading | DisplayState::NoData => {
                        self.state = DisplayState::Error(e.to_string());
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    fn apply_location(&mut self, record: LocationRecord) -> bool {
        if self.selected_bus_id() != Some(record.bus_id.as_str()) {
            return false;
        }

        if let Some(held) = self.state.location() {
            if record.recorded_at <= held.recorded_at {
                trace!(bus_id = %record.bus_id, "Ignoring older location");
                return false;
            }
        }

        self.state = DisplayState::Located(record);
        true
    }

    fn apply_bus(&mut self, bus: BusSnapshot) -> bool {
        match &self.bus {
            Some(held) if held.id == bus.id && *held != bus => {
                self.bus = Some(bus);
                true
            }
            _ => false,
        }
    }
}

// =============================================================================
// Service
// =============================================================================

/// Published after every change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LiveViewSnapshot {
    pub bus: Option<BusSnapshot>,
    pub state: DisplayState,
    pub marker: Option<MapMarker>,
    pub feed_connected: bool,
}

impl From<&LiveView> for LiveViewSnapshot {
    fn from(view: &LiveView) -> Self {
        Self {
            bus: view.bus.clone(),
            state: view.state.clone(),
            marker: view.marker(),
            feed_connected: view.feed_connected,
        }
    }
}

#[derive(Debug)]
enum LiveViewCommand {
    Select(BusSnapshot),
    Clear,
}

/// Handle for a running [`LiveViewService`].
#[derive(Debug, Clone)]
pub struct LiveViewHandle {
    commands: mpsc::Sender<LiveViewCommand>,
    snapshot: watch::Receiver<LiveViewSnapshot>,
}

impl LiveViewHandle {
    /// Show `bus`. Returns `false` if the service has stopped.
    pub async fn select(&self, bus: BusSnapshot) -> bool {
        self.commands.send(LiveViewCommand::Select(bus)).await.is_ok()
    }

    /// Close the view. Returns `false` if the service has stopped.
    pub async fn clear(&self) -> bool {
        self.commands.send(LiveViewCommand::Clear).await.is_ok()
    }

    pub fn snapshot(&self) -> LiveViewSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LiveViewSnapshot> {
        self.snapshot.clone()
    }
}

/// Runs a [`LiveView`] against a store and its realtime feed.
pub struct LiveViewService {
    view: LiveView,
    store: Arc<dyn TransitStore>,
    feed: Option<broadcast::Receiver<FeedEvent>>,
    commands: mpsc::Receiver<LiveViewCommand>,
    snapshot: watch::Sender<LiveViewSnapshot>,
    fetches: JoinSet<LiveViewMessage>,
}

impl LiveViewService {
    pub fn new(
        store: Arc<dyn TransitStore>,
        feed: &dyn RealtimeFeed,
    ) -> (Self, LiveViewHandle) {
        let view = LiveView::new();
        let (commands_tx, commands) = mpsc::channel(16);
        let (snapshot, snapshot_rx) = watch::channel(LiveViewSnapshot::from(&view));

        let service = Self {
            view,
            store,
            feed: Some(feed.subscribe()),
            commands,
            snapshot,
            fetches: JoinSet::new(),
        };
        let handle = LiveViewHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        };
        (service, handle)
    }

    /// Run until `shutdown` fires or every handle is dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Live view service starting");

        loop {
            let message = tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                command = self.commands.recv() => match command {
                    Some(LiveViewCommand::Select(bus)) => {
                        self.spawn_fetch(bus.id.clone());
                        LiveViewMessage::SelectBus(bus)
                    }
                    Some(LiveViewCommand::Clear) => LiveViewMessage::ClearSelection,
                    None => break,
                },

                Some(joined) = self.fetches.join_next(), if !self.fetches.is_empty() => {
                    match joined {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(error = %e, "Location fetch task failed");
                            continue;
                        }
                    }
                }

                received = recv_feed(&mut self.feed), if self.feed.is_some() => {
                    match received {
                        Ok(event) => LiveViewMessage::Feed(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Live view lagged behind the feed, refetching");
                            if let Some(bus_id) = self.view.selected_bus_id().map(str::to_string) {
                                self.spawn_fetch(bus_id);
                            }
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.feed = None;
                            LiveViewMessage::Feed(FeedEvent::SubscriptionDropped)
                        }
                    }
                }
            };

            if self.view.apply(message) {
                self.snapshot
                    .send_replace(LiveViewSnapshot::from(&self.view));
            }
        }

        self.fetches.shutdown().await;
        info!("Live view service stopped");
    }

    fn spawn_fetch(&mut self, bus_id: String) {
        let store = Arc::clone(&self.store);
        self.fetches.spawn(async move {
            let result = store.latest_location(&bus_id).await;
            LiveViewMessage::InitialFetch { bus_id, result }
        });
    }
}

async fn recv_feed(
    feed: &mut Option<broadcast::Receiver<FeedEvent>>,
) -> Result<FeedEvent, broadcast::error::RecvError> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::timestamp_from_millis;
    use crate::feed::ChangeEvent;
    use crate::store::MemoryStore;

    fn bus(id: &str) -> BusSnapshot {
        BusSnapshot::new(id, id.trim_start_matches('B'), "Ring").with_status(BusStatus::Active)
    }

    fn record(bus_id: &str, millis: i64) -> LocationRecord {
        LocationRecord {
            bus_id: bus_id.to_string(),
            trip_id: None,
            latitude: millis as f64 / 1000.0,
            longitude: 0.0,
            accuracy: None,
            speed: 0.0,
            heading: None,
            recorded_at: timestamp_from_millis(millis),
        }
    }

    fn pushed(record: LocationRecord) -> LiveViewMessage {
        LiveViewMessage::Feed(FeedEvent::Change(ChangeEvent::location_inserted(record)))
    }

    fn fetched(bus_id: &str, result: Result<Option<LocationRecord>, StoreError>) -> LiveViewMessage {
        LiveViewMessage::InitialFetch {
            bus_id: bus_id.to_string(),
            result,
        }
    }

    fn located_at(view: &LiveView) -> Option<i64> {
        view.state()
            .location()
            .map(|r| r.recorded_at.timestamp_millis())
    }

    #[test]
    fn test_older_push_does_not_replace_fetch() {
        let mut view = LiveView::new();
        view.apply(LiveViewMessage::SelectBus(bus("B1")));
        view.apply(fetched("B1", Ok(Some(record("B1", 100)))));

        assert!(!view.apply(pushed(record("B1", 90))));
        assert_eq!(located_at(&view), Some(100));
    }

    #[test]
    fn test_push_before_fetch_is_kept_when_newer() {
        let mut view = LiveView::new();
        view.apply(LiveViewMessage::SelectBus(bus("B1")));
        assert!(view.apply(pushed(record("B1", 120))));

        assert!(!view.apply(fetched("B1", Ok(Some(record("B1", 100))))));
        assert!(!view.apply(fetched("B1", Ok(None))));
        assert_eq!(located_at(&view), Some(120));
    }

    #[test]
    fn test_newer_push_replaces() {
        let mut view = LiveView::new();
        view.apply(LiveViewMessage::SelectBus(bus("B1")));
        view.apply(fetched("B1", Ok(Some(record("B1", 100)))));

        assert!(view.apply(pushed(record("B1", 200))));
        assert_eq!(located_at(&view), Some(200));
    }

    #[test]
    fn test_other_bus_update_is_ignored() {
        let mut view = LiveView::new();
        view.apply(LiveViewMessage::SelectBus(bus("B1")));
        view.apply(fetched("B1", Ok(Some(record("B1", 100)))));

        assert!(!view.apply(pushed(record("B2", 500))));
        assert_eq!(located_at(&view), Some(100));
    }

    #[test]
    fn test_no_history_is_no_data_not_error() {
        let mut view = LiveView::new();
        view.apply(LiveViewMessage::SelectBus(bus("B1")));
        assert_eq!(view.state(), &DisplayState::Loading);

        view.apply(fetched("B1", Ok(None)));
        assert_eq!(view.state(), &DisplayState::NoData);
        assert!(view.marker().is_none());
    }

    #[test]
    fn test_fetch_error_then_push_recovers() {
        let mut view = LiveView::new();
        view.apply(LiveViewMessage::SelectBus(bus("B1")));
        view.apply(fetched(
            "B1",
            Err(StoreError::Unavailable("connection reset".into())),
        ));
        assert!(matches!(view.state(), DisplayState::Error(_)));

        view.apply(pushed(record("B1", 10)));
        assert_eq!(located_at(&view), Some(10));
    }

    #[test]
    fn test_selecting_other_bus_clears_location() {
        let mut view = LiveView::new();
        view.apply(LiveViewMessage::SelectBus(bus("B1")));
        view.apply(fetched("B1", Ok(Some(record("B1", 100)))));

        view.apply(LiveViewMessage::SelectBus(bus("B2")));
        assert_eq!(view.state(), &DisplayState::Loading);
        assert!(view.marker().is_none());

        // Late result for the old selection.
        assert!(!view.apply(fetched("B1", Ok(Some(record("B1", 300))))));
        assert_eq!(view.state(), &DisplayState::Loading);
    }

    #[test]
    fn test_reselecting_same_bus_keeps_location() {
        let mut view = LiveView::new();
        view.apply(LiveViewMessage::SelectBus(bus("B1")));
        view.apply(fetched("B1", Ok(Some(record("B1", 100)))));

        assert!(!view.apply(LiveViewMessage::SelectBus(bus("B1"))));
        assert_eq!(located_at(&view), Some(100));
    }

    #[test]
    fn test_subscription_drop_keeps_last_location() {
        let mut view = LiveView::new();
        view.apply(LiveViewMessage::SelectBus(bus("B1")));
        view.apply(fetched("B1", Ok(Some(record("B1", 100)))));

        assert!(view.apply(LiveViewMessage::Feed(FeedEvent::SubscriptionDropped)));
        assert!(!view.feed_connected());
        assert_eq!(located_at(&view), Some(100));

        view.apply(pushed(record("B1", 150)));
        assert!(view.feed_connected());
        assert_eq!(located_at(&view), Some(150));
    }

    #[test]
    fn test_bus_update_changes_marker_status() {
        let mut view = LiveView::new();
        view.apply(LiveViewMessage::SelectBus(bus("B1")));
        view.apply(fetched("B1", Ok(Some(record("B1", 100)))));
        assert_eq!(view.marker().unwrap().status, BusStatus::Active);

        let updated = bus("B1").with_status(BusStatus::Inactive);
        view.apply(LiveViewMessage::Feed(FeedEvent::Change(
            ChangeEvent::bus_updated(updated),
        )));

        let marker = view.marker().unwrap();
        assert_eq!(marker.status, BusStatus::Inactive);
        assert_eq!(marker.latitude, 0.1);
    }

    #[test]
    fn test_clear_selection() {
        let mut view = LiveView::new();
        view.apply(LiveViewMessage::SelectBus(bus("B1")));
        assert!(view.apply(LiveViewMessage::ClearSelection));
        assert_eq!(view.state(), &DisplayState::NoSelection);
        assert!(!view.apply(pushed(record("B1", 100))));
    }

    #[tokio::test]
    async fn test_service_follows_store_inserts() {
        let store = Arc::new(MemoryStore::with_buses([bus("B1"), bus("B2")]));
        let (service, handle) = LiveViewService::new(store.clone(), store.as_ref());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(service.run(shutdown.clone()));
        let mut updates = handle.subscribe();

        assert!(handle.select(bus("B1")).await);
        updates
            .wait_for(|s| s.state == DisplayState::NoData)
            .await
            .unwrap();

        store.insert_location(record("B2", 50)).await.unwrap();
        store.insert_location(record("B1", 100)).await.unwrap();
        let snapshot = updates
            .wait_for(|s| s.marker.is_some())
            .await
            .unwrap()
            .clone();
        assert_eq!(snapshot.marker.unwrap().bus_id, "B1");

        store.drop_subscriptions();
        updates.wait_for(|s| !s.feed_connected).await.unwrap();
        assert_eq!(
            handle.snapshot().state.location().map(|r| r.bus_id.as_str()),
            Some("B1")
        );

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_service_initial_fetch_uses_latest_location() {
        let store = Arc::new(MemoryStore::with_buses([bus("B1")]));
        store.insert_location(record("B1", 100)).await.unwrap();
        store.insert_location(record("B1", 200)).await.unwrap();

        let (service, handle) = LiveViewService::new(store.clone(), store.as_ref());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(service.run(shutdown.clone()));
        let mut updates = handle.subscribe();

        handle.select(bus("B1")).await;
        let snapshot = updates
            .wait_for(|s| s.marker.is_some())
            .await
            .unwrap()
            .clone();
        assert_eq!(snapshot.marker.unwrap().recorded_at.timestamp_millis(), 200);

        drop(handle);
        drop(updates);
        task.await.unwrap();
        assert!(!shutdown.is_cancelled());
    }
}
