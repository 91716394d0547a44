//! End-to-end tracking flow: a conductor replays a recorded track through a
//! trip while a passenger follows the bus on the live view.

use std::sync::Arc;

use bustrack::auth::{Identity, StaticAuth, UserRole};
use bustrack::clock::{timestamp_from_millis, ManualClock};
use bustrack::live_view::{DisplayState, LiveViewService};
use bustrack::model::{BusSnapshot, BusStatus};
use bustrack::notify::{ChannelNotifier, Notifier};
use bustrack::position::Position;
use bustrack::route_search::{search_store, RouteQuery};
use bustrack::sampler::{PositionSampler, SamplerOptions, ScriptedProvider};
use bustrack::session::{SessionConfig, SessionDriver, TrackingSession};
use bustrack::store::MemoryStore;
use bustrack::trip::TripController;
use tokio_util::sync::CancellationToken;

const BASE_MS: i64 = 1_700_000_000_000;

fn track() -> Vec<Position> {
    [0, 1_000, 4_000, 6_000, 9_000, 11_000]
        .iter()
        .enumerate()
        .map(|(i, offset)| {
            Position::new(
                12.97 + i as f64 * 0.001,
                77.59,
                timestamp_from_millis(BASE_MS + offset),
            )
            .with_accuracy(8.0)
        })
        .collect()
}

fn bus() -> BusSnapshot {
    BusSnapshot::new("bus-42", "42", "City Loop").with_route(
        "Central Station",
        ["Market", "University"],
        "Airport",
    )
}

#[tokio::test(start_paused = true)]
async fn test_replayed_trip_is_throttled_and_followed_live() {
    let store = Arc::new(MemoryStore::with_buses([bus()]));
    let clock = Arc::new(ManualClock::at_millis(BASE_MS));
    let provider = Arc::new(ScriptedProvider::from_track(&track(), 1.0).with_clock(clock.clone()));
    let mut finished = provider.finished();
    let (notifier, mut notifications) = ChannelNotifier::new();
    let notifier: Arc<dyn Notifier> = Arc::new(notifier);
    let shutdown = CancellationToken::new();

    // Passenger view.
    let (live_view, passenger) = LiveViewService::new(store.clone(), store.as_ref());
    let live_task = tokio::spawn(live_view.run(shutdown.clone()));

    // Conductor session.
    let session = TrackingSession::new(
        PositionSampler::new(provider.clone(), SamplerOptions::default()),
        store.clone(),
        notifier.clone(),
        clock.clone(),
        SessionConfig::default(),
    );
    let (driver, handle) = SessionDriver::new(session);
    let driver_task = tokio::spawn(driver.run(shutdown.clone()));

    let auth = Arc::new(StaticAuth::signed_in(Identity::new(
        "conductor-7",
        UserRole::Conductor,
    )));
    let mut trips = TripController::new(store.clone(), auth, handle.clone(), notifier, clock);

    // Nothing active yet, so the passenger search finds nothing.
    let query = RouteQuery::new("market", "airport");
    assert!(search_store(store.as_ref(), &query).await.unwrap().is_empty());

    passenger.select(bus()).await;
    let mut view = passenger.subscribe();
    view.wait_for(|s| s.state == DisplayState::NoData)
        .await
        .unwrap();

    let trip = trips.start_trip("bus-42").await.unwrap();
    assert_eq!(store.bus("bus-42").unwrap().status, BusStatus::Active);
    assert_eq!(search_store(store.as_ref(), &query).await.unwrap().len(), 1);

    finished.wait_for(|count| *count == 1).await.unwrap();
    handle
        .subscribe()
        .wait_for(|s| s.stats.received == 6)
        .await
        .unwrap();

    trips.end_trip().await.unwrap();

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.stats.accepted, 3);
    assert_eq!(snapshot.stats.throttled, 3);

    let marker = view
        .wait_for(|s| {
            s.marker
                .as_ref()
                .is_some_and(|m| m.recorded_at == timestamp_from_millis(BASE_MS + 11_000))
        })
        .await
        .unwrap()
        .marker
        .clone()
        .unwrap();
    assert_eq!(marker.bus_number, "42");

    shutdown.cancel();
    driver_task.await.unwrap();
    live_task.await.unwrap();

    let records = store.locations();
    let offsets: Vec<i64> = records
        .iter()
        .map(|r| r.recorded_at.timestamp_millis() - BASE_MS)
        .collect();
    assert_eq!(offsets, vec![0, 6_000, 11_000]);
    assert!(records
        .iter()
        .all(|r| r.trip_id.as_deref() == Some(trip.id.as_str()) && r.speed == 0.0));

    let closed = store.trip(&trip.id).unwrap();
    assert!(!closed.is_active);
    assert!(closed.ended_at.is_some());
    assert_eq!(store.bus("bus-42").unwrap().status, BusStatus::Inactive);
    assert!(search_store(store.as_ref(), &query).await.unwrap().is_empty());

    let mut titles = Vec::new();
    while let Ok(n) = notifications.try_recv() {
        titles.push(n.title);
    }
    assert_eq!(titles, vec!["Trip Started", "Trip Ended"]);
}

#[tokio::test(start_paused = true)]
async fn test_write_failures_do_not_stop_tracking() {
    let store = Arc::new(MemoryStore::with_buses([bus()]));
    store.set_fail_writes(true);
    let clock = Arc::new(ManualClock::at_millis(BASE_MS));
    let provider = Arc::new(ScriptedProvider::from_track(&track(), 1.0).with_clock(clock.clone()));
    let mut finished = provider.finished();
    let (notifier, mut notifications) = ChannelNotifier::new();

    let session = TrackingSession::new(
        PositionSampler::new(provider.clone(), SamplerOptions::default()),
        store.clone(),
        Arc::new(notifier),
        clock,
        SessionConfig::default(),
    );
    let (driver, handle) = SessionDriver::new(session);
    let shutdown = CancellationToken::new();
    let driver_task = tokio::spawn(driver.run(shutdown.clone()));

    handle.start("bus-42", None).await.unwrap();
    finished.wait_for(|count| *count == 1).await.unwrap();
    handle
        .subscribe()
        .wait_for(|s| s.stats.received == 6)
        .await
        .unwrap();

    shutdown.cancel();
    driver_task.await.unwrap();

    let stats = handle.snapshot().stats;
    assert_eq!(stats.accepted, 3);
    assert_eq!(stats.write_failures, 3);
    assert_eq!(store.location_count(), 0);

    let mut failures = 0;
    while let Ok(n) = notifications.try_recv() {
        assert_eq!(n.title, "Location Update Failed");
        failures += 1;
    }
    assert_eq!(failures, 3);
}
