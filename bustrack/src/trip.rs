//! Conductor trip lifecycle.
//!
//! Starting a trip marks the bus active under the conductor, opens a trip row
//! and starts the tracking session for it. Ending a trip stops the session
//! first, so no location can be recorded against a trip that is already
//! closed, then closes the trip row and marks the bus inactive.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::auth::{AuthProvider, UserRole};
use crate::clock::{Clock, Timestamp};
use crate::model::{BusStatus, Trip};
use crate::notify::{Notification, Notifier};
use crate::session::{SessionError, SessionHandle};
use crate::store::{BusUpdate, StoreError, TransitStore};

/// Errors from trip operations.
#[derive(Debug, Error)]
pub enum TripError {
    #[error("Not signed in")]
    NotSignedIn,

    #[error("A {role} cannot broadcast bus locations")]
    NotAuthorized { role: UserRole },

    #[error("Trip {trip_id} is already active")]
    AlreadyActive { trip_id: String },

    #[error("No active trip")]
    NoActiveTrip,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Drives trips for the signed-in conductor.
pub struct TripController {
    store: Arc<dyn TransitStore>,
    auth: Arc<dyn AuthProvider>,
    session: SessionHandle,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    current: Option<Trip>,
}

impl TripController {
    pub fn new(
        store: Arc<dyn TransitStore>,
        auth: Arc<dyn AuthProvider>,
        session: SessionHandle,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            auth,
            session,
            notifier,
            clock,
            current: None,
        }
    }

    /// The trip in progress, if any.
    pub fn current_trip(&self) -> Option<&Trip> {
        self.current.as_ref()
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Start a trip on `bus_id` for the signed-in conductor.
    pub async fn start_trip(&mut self, bus_id: &str) -> Result<Trip, TripError> {
        let result = self.try_start_trip(bus_id).await;
        match &result {
            Ok(trip) => {
                info!(trip_id = %trip.id, bus_id, "Trip started");
                self.notifier.notify(Notification::info(
                    "Trip Started",
                    "Your trip has been started successfully",
                ));
            }
            Err(e) => {
                error!(bus_id, error = %e, "Failed to start trip");
                self.notifier
                    .notify(Notification::error("Error", "Failed to start trip"));
            }
        }
        result
    }

    async fn try_start_trip(&mut self, bus_id: &str) -> Result<Trip, TripError> {
        let identity = self.auth.current_identity().ok_or(TripError::NotSignedIn)?;
        if !identity.role.can_broadcast() {
            return Err(TripError::NotAuthorized {
                role: identity.role,
            });
        }
        if let Some(trip) = &self.current {
            return Err(TripError::AlreadyActive {
                trip_id: trip.id.clone(),
            });
        }

        self.store
            .update_bus(
                bus_id,
                BusUpdate::assign(BusStatus::Active, identity.user_id.as_str()),
            )
            .await?;

        let trip = self
            .store
            .insert_trip(bus_id, &identity.user_id, self.clock.now())
            .await?;

        if let Err(e) = self.session.start(bus_id, Some(trip.id.clone())).await {
            warn!(trip_id = %trip.id, error = %e, "Tracking did not start, closing trip");
            self.close_trip(&trip).await?;
            return Err(e.into());
        }

        self.current = Some(trip.clone());
        Ok(trip)
    }

    /// End the trip in progress.
    ///
    /// Tracking stops before the trip row is closed. If closing fails the
    /// trip stays current so the call can be retried.
    pub async fn end_trip(&mut self) -> Result<Trip, TripError> {
        let result = self.try_end_trip().await;
        match &result {
            Ok(trip) => {
                info!(trip_id = %trip.id, bus_id = %trip.bus_id, "Trip ended");
                self.notifier.notify(Notification::info(
                    "Trip Ended",
                    "Your trip has been ended successfully",
                ));
            }
            Err(TripError::NoActiveTrip) => {}
            Err(e) => {
                error!(error = %e, "Failed to end trip");
                self.notifier
                    .notify(Notification::error("Error", "Failed to end trip"));
            }
        }
        result
    }

    async fn try_end_trip(&mut self) -> Result<Trip, TripError> {
        let trip = self.current.clone().ok_or(TripError::NoActiveTrip)?;

        match self.session.stop().await {
            Ok(_) => {}
            Err(SessionError::Closed) => {
                warn!(trip_id = %trip.id, "Tracking session already gone")
            }
            Err(e) => return Err(e.into()),
        }

        let ended_at = self.close_trip(&trip).await?;
        self.current = None;
        Ok(Trip {
            ended_at: Some(ended_at),
            is_active: false,
            ..trip
        })
    }

    /// End the current trip if there is one. Used before signing out.
    pub async fn end_active_trip(&mut self) -> Result<Option<Trip>, TripError> {
        if self.current.is_none() {
            return Ok(None);
        }
        self.end_trip().await.map(Some)
    }

    async fn close_trip(&self, trip: &Trip) -> Result<Timestamp, TripError> {
        let ended_at = self.clock.now();
        self.store.end_trip(&trip.id, ended_at).await?;
        self.store
            .update_bus(&trip.bus_id, BusUpdate::status(BusStatus::Inactive))
            .await?;
        Ok(ended_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Identity, StaticAuth};
    use crate::clock::{timestamp_from_millis, ManualClock};
    use crate::model::{BusSnapshot, LocationRecord};
    use crate::notify::ChannelNotifier;
    use crate::position::Position;
    use crate::sampler::{ManualProvider, PositionSampler, SamplerOptions};
    use crate::session::{SessionConfig, SessionDriver, SessionStatus, TrackingSession};
    use crate::store::{BoxFuture, BusFilter, MemoryStore, StoreResult};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        provider: Arc<ManualProvider>,
        store: Arc<MemoryStore>,
        auth: Arc<StaticAuth>,
        notifications: mpsc::UnboundedReceiver<Notification>,
        controller: TripController,
        shutdown: CancellationToken,
        driver: tokio::task::JoinHandle<()>,
    }

    /// Backend whose location inserts take a while, recording call order.
    struct SlowInsertStore {
        inner: Arc<MemoryStore>,
        delay: Duration,
        calls: Mutex<Vec<String>>,
    }

    impl TransitStore for SlowInsertStore {
        fn insert_location(&self, record: LocationRecord) -> BoxFuture<'_, StoreResult<()>> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                self.calls.lock().push(format!(
                    "insert_location {}",
                    record.trip_id.as_deref().unwrap_or("-")
                ));
                self.inner.insert_location(record).await
            })
        }

        fn insert_trip(
            &self,
            bus_id: &str,
            conductor_id: &str,
            started_at: Timestamp,
        ) -> BoxFuture<'_, StoreResult<Trip>> {
            self.inner.insert_trip(bus_id, conductor_id, started_at)
        }

        fn end_trip(&self, trip_id: &str, ended_at: Timestamp) -> BoxFuture<'_, StoreResult<()>> {
            self.calls.lock().push(format!("end_trip {}", trip_id));
            self.inner.end_trip(trip_id, ended_at)
        }

        fn update_bus(&self, bus_id: &str, update: BusUpdate) -> BoxFuture<'_, StoreResult<()>> {
            self.inner.update_bus(bus_id, update)
        }

        fn get_bus(&self, bus_id: &str) -> BoxFuture<'_, StoreResult<Option<BusSnapshot>>> {
            self.inner.get_bus(bus_id)
        }

        fn list_buses(&self, filter: BusFilter) -> BoxFuture<'_, StoreResult<Vec<BusSnapshot>>> {
            self.inner.list_buses(filter)
        }

        fn latest_location(
            &self,
            bus_id: &str,
        ) -> BoxFuture<'_, StoreResult<Option<LocationRecord>>> {
            self.inner.latest_location(bus_id)
        }
    }

    fn fixture(provider: ManualProvider, role: UserRole) -> Fixture {
        let store = Arc::new(MemoryStore::with_buses([BusSnapshot::new("B1", "1", "Ring")]));
        fixture_with_backend(provider, role, store.clone(), store)
    }

    /// `store` is inspected by the test; `backend` is what the code under test talks to.
    fn fixture_with_backend(
        provider: ManualProvider,
        role: UserRole,
        store: Arc<MemoryStore>,
        backend: Arc<dyn TransitStore>,
    ) -> Fixture {
        let provider = Arc::new(provider);
        let auth = Arc::new(StaticAuth::signed_in(Identity::new("conductor-1", role)));
        let clock = Arc::new(ManualClock::at_millis(1_000));
        let (notifier, notifications) = ChannelNotifier::new();
        let notifier: Arc<dyn Notifier> = Arc::new(notifier);

        let session = TrackingSession::new(
            PositionSampler::new(provider.clone(), SamplerOptions::default()),
            backend.clone(),
            notifier.clone(),
            clock.clone(),
            SessionConfig::default(),
        );
        let (driver, handle) = SessionDriver::new(session);
        let shutdown = CancellationToken::new();
        let driver = tokio::spawn(driver.run(shutdown.clone()));

        let controller =
            TripController::new(backend, auth.clone(), handle, notifier, clock);

        Fixture {
            provider,
            store,
            auth,
            notifications,
            controller,
            shutdown,
            driver,
        }
    }

    fn titles(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<String> {
        let mut titles = Vec::new();
        while let Ok(n) = rx.try_recv() {
            titles.push(n.title);
        }
        titles
    }

    #[tokio::test]
    async fn test_start_and_end_trip() {
        let mut f = fixture(ManualProvider::new(), UserRole::Conductor);

        let trip = f.controller.start_trip("B1").await.unwrap();
        assert!(trip.is_active);
        assert_eq!(trip.conductor_id, "conductor-1");
        let bus = f.store.bus("B1").unwrap();
        assert_eq!(bus.status, BusStatus::Active);
        assert_eq!(bus.conductor_id.as_deref(), Some("conductor-1"));
        assert_eq!(f.controller.session().snapshot().status, SessionStatus::Watching);

        let ended = f.controller.end_trip().await.unwrap();
        assert!(!ended.is_active);
        assert!(f.controller.current_trip().is_none());
        assert_eq!(f.controller.session().snapshot().status, SessionStatus::Idle);
        assert_eq!(f.store.bus("B1").unwrap().status, BusStatus::Inactive);
        assert!(!f.store.trip(&trip.id).unwrap().is_active);

        assert_eq!(titles(&mut f.notifications), vec!["Trip Started", "Trip Ended"]);
        f.shutdown.cancel();
        f.driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_end_trip_stops_sampling_before_closing() {
        let mut f = fixture(ManualProvider::new(), UserRole::Conductor);
        f.controller.start_trip("B1").await.unwrap();

        f.controller.end_trip().await.unwrap();
        assert_eq!(f.provider.active_watch_count(), 0);
        assert_eq!(
            f.provider
                .deliver(Ok(Position::new(1.0, 2.0, timestamp_from_millis(0)))),
            0
        );

        f.shutdown.cancel();
        f.driver.await.unwrap();
        assert_eq!(f.store.location_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_trip_waits_for_in_flight_location_write() {
        let store = Arc::new(MemoryStore::with_buses([BusSnapshot::new("B1", "1", "Ring")]));
        let backend = Arc::new(SlowInsertStore {
            inner: store.clone(),
            delay: Duration::from_millis(50),
            calls: Mutex::new(Vec::new()),
        });
        let mut f = fixture_with_backend(
            ManualProvider::new(),
            UserRole::Conductor,
            store,
            backend.clone(),
        );

        let trip = f.controller.start_trip("B1").await.unwrap();
        f.provider
            .deliver(Ok(Position::new(1.0, 2.0, timestamp_from_millis(0))));
        f.controller
            .session()
            .subscribe()
            .wait_for(|s| s.stats.accepted == 1)
            .await
            .unwrap();

        f.controller.end_trip().await.unwrap();

        assert_eq!(
            *backend.calls.lock(),
            vec![
                format!("insert_location {}", trip.id),
                format!("end_trip {}", trip.id),
            ]
        );
        let records = f.store.locations();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].trip_id.as_deref(), Some(trip.id.as_str()));

        f.shutdown.cancel();
        f.driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_passenger_cannot_start_trip() {
        let mut f = fixture(ManualProvider::new(), UserRole::Passenger);
        assert!(matches!(
            f.controller.start_trip("B1").await,
            Err(TripError::NotAuthorized {
                role: UserRole::Passenger
            })
        ));
        assert_eq!(f.store.bus("B1").unwrap().status, BusStatus::Inactive);
        assert_eq!(titles(&mut f.notifications), vec!["Error"]);
    }

    #[tokio::test]
    async fn test_signed_out_cannot_start_trip() {
        let mut f = fixture(ManualProvider::new(), UserRole::Conductor);
        f.auth.sign_out();
        assert!(matches!(
            f.controller.start_trip("B1").await,
            Err(TripError::NotSignedIn)
        ));
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let mut f = fixture(ManualProvider::new(), UserRole::Admin);
        let trip = f.controller.start_trip("B1").await.unwrap();
        match f.controller.start_trip("B1").await {
            Err(TripError::AlreadyActive { trip_id }) => assert_eq!(trip_id, trip.id),
            other => panic!("expected AlreadyActive, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsupported_device_closes_trip() {
        let mut f = fixture(ManualProvider::unsupported(), UserRole::Conductor);

        let err = f.controller.start_trip("B1").await.unwrap_err();
        assert!(matches!(err, TripError::Session(SessionError::Sampling(_))));
        assert!(f.controller.current_trip().is_none());
        assert!(!f.store.trip("trip-1").unwrap().is_active);
        assert_eq!(f.store.bus("B1").unwrap().status, BusStatus::Inactive);
    }

    #[tokio::test]
    async fn test_store_failure_reports_error() {
        let mut f = fixture(ManualProvider::new(), UserRole::Conductor);
        f.store.set_fail_writes(true);

        assert!(matches!(
            f.controller.start_trip("B1").await,
            Err(TripError::Store(StoreError::WriteFailed { .. }))
        ));
        assert_eq!(titles(&mut f.notifications), vec!["Error"]);
        assert_eq!(f.controller.session().snapshot().status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_failed_end_keeps_trip_for_retry() {
        let mut f = fixture(ManualProvider::new(), UserRole::Conductor);
        f.controller.start_trip("B1").await.unwrap();

        f.store.set_fail_writes(true);
        assert!(f.controller.end_trip().await.is_err());
        assert!(f.controller.current_trip().is_some());
        assert_eq!(f.controller.session().snapshot().status, SessionStatus::Idle);

        f.store.set_fail_writes(false);
        assert!(f.controller.end_active_trip().await.unwrap().is_some());
        assert!(f.controller.end_active_trip().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_end_without_trip() {
        let mut f = fixture(ManualProvider::new(), UserRole::Conductor);
        assert!(matches!(
            f.controller.end_trip().await,
            Err(TripError::NoActiveTrip)
        ));
        assert!(titles(&mut f.notifications).is_empty());
    }
}
