//! Live tracking session for a conductor's device.
//!
//! A [`TrackingSession`] turns a stream of device fixes into location records
//! for one bus (and optionally one trip):
//!
//! ```text
//!            start(bus, trip)                 stop() / sampling unsupported
//!   Idle ─────────────────────────► Watching ─────────────────────────────► Idle
//!                                     │  ▲
//!                                     └──┘ fix ──► throttle ──► record ──► store (spawned)
//!                                          error ──► notify, stay Watching
//! ```
//!
//! # Cancellation
//!
//! Every watch is tagged with a session generation. `start` and `stop` bump
//! the generation, and a delivered sample is acted on only if the session is
//! watching and the sample carries the current generation. A fix already in
//! flight when `stop` runs is therefore discarded.
//!
//! # Writes
//!
//! Accepted records are written on spawned tasks. The session never waits for
//! a write before accepting the next sample; a failed write is logged,
//! notified and dropped. The next accepted sample tries again after the next
//! throttle window.
//!
//! A stop through [`SessionHandle::stop`] replies only once every write
//! accepted before it has settled, so a caller that closes the trip afterwards
//! never sees a record land on an ended trip.
//!
//! [`SessionDriver`] owns a session and runs its event loop on a single task,
//! taking start/stop commands through a [`SessionHandle`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::model::{LocationRecord, DEFAULT_MAX_ACCURACY_M};
use crate::notify::{Notification, Notifier};
use crate::position::PositionError;
use crate::sampler::{FixResult, PositionSampler};
use crate::store::TransitStore;
use crate::throttle::{EmissionThrottle, DEFAULT_MIN_INTERVAL};

/// Command channel capacity for [`SessionDriver`].
pub const DEFAULT_COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Tunables for a tracking session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Minimum time between two persisted records.
    pub min_interval: Duration,
    /// Accuracy values above this are clamped before persisting.
    pub max_accuracy_m: f64,
    /// Request a one-shot fix on start instead of waiting for the first watch
    /// callback.
    pub seed_on_start: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_MIN_INTERVAL,
            max_accuracy_m: DEFAULT_MAX_ACCURACY_M,
            seed_on_start: false,
        }
    }
}

/// Externally visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Idle,
    Watching,
}

/// What the session is currently broadcasting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingTarget {
    pub bus_id: String,
    pub trip_id: Option<String>,
}

#[derive(Debug)]
enum SessionState {
    Idle,
    Watching(TrackingTarget),
}

/// A fix delivered by the sampler, tagged with the generation of the watch
/// that produced it.
#[derive(Debug, Clone, Copy)]
pub struct SampleEvent {
    pub generation: u64,
    pub fix: FixResult,
}

/// What happened to a delivered sample.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// Passed the throttle; the record was handed to the store.
    Accepted(LocationRecord),
    /// Arrived inside the throttle window and was dropped.
    Throttled,
    /// Arrived while idle or from a cancelled watch.
    Discarded,
    /// The device reported an error.
    Failed(PositionError),
}

/// Something the session's event loop has to react to.
#[derive(Debug)]
pub enum SessionEvent {
    Sample(SampleEvent),
    /// A spawned location write finished, successfully or not.
    WriteSettled,
}

/// Counters over the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    pub received: u64,
    pub accepted: u64,
    pub throttled: u64,
    pub discarded: u64,
    pub sampling_errors: u64,
    pub write_failures: u64,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub target: Option<TrackingTarget>,
    pub stats: SessionStats,
}

/// Conductor-side tracking session.
pub struct TrackingSession {
    state: SessionState,
    generation: u64,
    throttle: EmissionThrottle,
    sampler: PositionSampler,
    store: Arc<dyn TransitStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    samples_tx: mpsc::UnboundedSender<SampleEvent>,
    samples_rx: mpsc::UnboundedReceiver<SampleEvent>,
    writes: JoinSet<()>,
    stats: SessionStats,
    write_failures: Arc<AtomicU64>,
}

impl TrackingSession {
    pub fn new(
        sampler: PositionSampler,
        store: Arc<dyn TransitStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        Self {
            state: SessionState::Idle,
            generation: 0,
            throttle: EmissionThrottle::new(config.min_interval),
            sampler,
            store,
            notifier,
            clock,
            config,
            samples_tx,
            samples_rx,
            writes: JoinSet::new(),
            stats: SessionStats::default(),
            write_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn status(&self) -> SessionStatus {
        match self.state {
            SessionState::Idle => SessionStatus::Idle,
            SessionState::Watching(_) => SessionStatus::Watching,
        }
    }

    pub fn target(&self) -> Option<&TrackingTarget> {
        match &self.state {
            SessionState::Idle => None,
            SessionState::Watching(target) => Some(target),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            write_failures: self.write_failures.load(Ordering::Relaxed),
            ..self.stats
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status(),
            target: self.target().cloned(),
            stats: self.stats(),
        }
    }

    /// Begin broadcasting positions for `bus_id`.
    ///
    /// Starting while already watching switches to the new target; the old
    /// watch is cancelled first. If the device cannot sample at all the
    /// session ends up idle and the error is notified and returned.
    pub fn start(
        &mut self,
        bus_id: impl Into<String>,
        trip_id: Option<String>,
    ) -> Result<(), PositionError> {
        let target = TrackingTarget {
            bus_id: bus_id.into(),
            trip_id,
        };

        if let SessionState::Watching(previous) = &self.state {
            info!(
                from_bus = %previous.bus_id,
                to_bus = %target.bus_id,
                "Restarting tracking session"
            );
        }

        self.generation += 1;
        self.state = SessionState::Idle;
        self.sampler.end();

        let generation = self.generation;
        let tx = self.samples_tx.clone();
        if let Err(e) = self.sampler.begin(move |fix| {
            // The receiver lives as long as the session.
            let _ = tx.send(SampleEvent { generation, fix });
        }) {
            warn!(bus_id = %target.bus_id, error = %e, "Cannot start tracking");
            self.notifier
                .notify(Notification::error(e.title(), e.to_string()));
            return Err(e);
        }

        if self.config.seed_on_start {
            let tx = self.samples_tx.clone();
            self.sampler.spawn_current_position(move |fix| {
                let _ = tx.send(SampleEvent { generation, fix });
            });
        }

        self.throttle.reset();
        info!(
            bus_id = %target.bus_id,
            trip_id = ?target.trip_id,
            generation,
            "Tracking session watching"
        );
        self.state = SessionState::Watching(target);
        Ok(())
    }

    /// Stop broadcasting. Returns `false` if the session was already idle.
    pub fn stop(&mut self) -> bool {
        let SessionState::Watching(target) = std::mem::replace(&mut self.state, SessionState::Idle)
        else {
            return false;
        };

        self.sampler.end();
        self.generation += 1;
        info!(bus_id = %target.bus_id, trip_id = ?target.trip_id, "Tracking session stopped");
        true
    }

    /// Act on one delivered sample.
    pub fn handle_sample(&mut self, event: SampleEvent) -> SampleOutcome {
        self.reap_writes();
        self.stats.received += 1;

        let target = match &self.state {
            SessionState::Watching(target) if event.generation == self.generation => target,
            _ => {
                self.stats.discarded += 1;
                trace!(
                    sample_generation = event.generation,
                    generation = self.generation,
                    "Discarding stale sample"
                );
                return SampleOutcome::Discarded;
            }
        };

        let position = match event.fix {
            Ok(position) => position,
            Err(e) => {
                self.stats.sampling_errors += 1;
                warn!(bus_id = %target.bus_id, error = ?e, "Sampling error");
                self.notifier
                    .notify(Notification::error(e.title(), e.to_string()));
                return SampleOutcome::Failed(e);
            }
        };

        let now = self.clock.now();
        if !self.throttle.can_emit(now) {
            self.stats.throttled += 1;
            trace!(bus_id = %target.bus_id, "Sample throttled");
            return SampleOutcome::Throttled;
        }

        let record = LocationRecord::from_position(
            target.bus_id.clone(),
            target.trip_id.clone(),
            &position,
            self.config.max_accuracy_m,
            now,
        );
        self.stats.accepted += 1;
        debug!(
            bus_id = %record.bus_id,
            latitude = record.latitude,
            longitude = record.longitude,
            "Location accepted"
        );
        self.spawn_write(record.clone());
        SampleOutcome::Accepted(record)
    }

    /// Wait for the next delivered sample.
    pub async fn next_sample(&mut self) -> Option<SampleEvent> {
        self.samples_rx.recv().await
    }

    /// Wait for the next delivered sample or settled write.
    pub async fn next_event(&mut self) -> SessionEvent {
        tokio::select! {
            biased;

            Some(result) = self.writes.join_next(), if !self.writes.is_empty() => {
                log_write_join(result);
                SessionEvent::WriteSettled
            }

            Some(event) = self.samples_rx.recv() => SessionEvent::Sample(event),

            else => std::future::pending::<SessionEvent>().await,
        }
    }

    /// Location writes spawned but not yet settled.
    pub fn writes_in_flight(&self) -> usize {
        self.writes.len()
    }

    /// Handle every sample already delivered, without waiting.
    pub fn process_pending(&mut self) -> Vec<SampleOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(event) = self.samples_rx.try_recv() {
            outcomes.push(self.handle_sample(event));
        }
        outcomes
    }

    /// Wait for all in-flight writes to settle.
    pub async fn flush_writes(&mut self) {
        while let Some(result) = self.writes.join_next().await {
            log_write_join(result);
        }
    }

    fn spawn_write(&mut self, record: LocationRecord) {
        let store = Arc::clone(&self.store);
        let notifier = Arc::clone(&self.notifier);
        let failures = Arc::clone(&self.write_failures);

        self.writes.spawn(async move {
            let bus_id = record.bus_id.clone();
            if let Err(e) = store.insert_location(record).await {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!(bus_id = %bus_id, error = %e, "Location write failed, sample dropped");
                notifier.notify(Notification::error("Location Update Failed", e.to_string()));
            }
        });
    }

    fn reap_writes(&mut self) {
        while let Some(result) = self.writes.try_join_next() {
            log_write_join(result);
        }
    }
}

fn log_write_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            warn!(error = %e, "Location write task panicked");
        }
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        self.stop();
        // In-flight writes run to completion and report their own failures.
        self.writes.detach_all();
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Errors talking to a running [`SessionDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Tracking session is not running")]
    Closed,

    #[error(transparent)]
    Sampling(#[from] PositionError),
}

enum SessionCommand {
    Start {
        target: TrackingTarget,
        reply: oneshot::Sender<Result<(), PositionError>>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Start (or restart) tracking and wait until the watch is registered.
    pub async fn start(
        &self,
        bus_id: impl Into<String>,
        trip_id: Option<String>,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        let target = TrackingTarget {
            bus_id: bus_id.into(),
            trip_id,
        };
        self.commands
            .send(SessionCommand::Start { target, reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)??;
        Ok(())
    }

    /// Stop tracking. When this returns no further record will be produced and
    /// every record accepted earlier has been written or reported as failed.
    pub async fn stop(&self) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Stop { reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every snapshot change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }
}

impl std::fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionCommand::Start { target, .. } => {
                f.debug_struct("Start").field("target", target).finish()
            }
            SessionCommand::Stop { .. } => f.write_str("Stop"),
        }
    }
}

/// Stop replies held back until in-flight writes settle.
type StopWaiter = (oneshot::Sender<bool>, bool);

/// Runs a [`TrackingSession`] on a single task.
pub struct SessionDriver {
    session: TrackingSession,
    commands: mpsc::Receiver<SessionCommand>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl SessionDriver {
    /// Wrap a session, returning the driver and a handle for controlling it.
    pub fn new(session: TrackingSession) -> (Self, SessionHandle) {
        let (commands_tx, commands) = mpsc::channel(DEFAULT_COMMAND_CHANNEL_CAPACITY);
        let (snapshot, snapshot_rx) = watch::channel(session.snapshot());

        let driver = Self {
            session,
            commands,
            snapshot,
        };
        let handle = SessionHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        };
        (driver, handle)
    }

    /// Run until `shutdown` fires or every handle is dropped.
    ///
    /// Commands are served before samples so a queued stop takes effect
    /// before any sample that arrived alongside it.
    pub async fn run(self, shutdown: CancellationToken) {
        let Self {
            mut session,
            mut commands,
            snapshot,
        } = self;

        info!("Tracking session driver starting");
        let mut stop_waiters: Vec<StopWaiter> = Vec::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Tracking session driver shutting down");
                    break;
                }

                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("All session handles dropped");
                        break;
                    };
                    Self::handle_command(&mut session, &snapshot, &mut stop_waiters, command);
                }

                event = session.next_event() => {
                    if let SessionEvent::Sample(event) = event {
                        session.handle_sample(event);
                    }
                }
            }

            snapshot.send_replace(session.snapshot());
            if session.writes_in_flight() == 0 {
                release_stop_waiters(&mut stop_waiters);
            }
        }

        session.stop();
        session.flush_writes().await;
        snapshot.send_replace(session.snapshot());
        release_stop_waiters(&mut stop_waiters);
        info!(stats = ?session.stats(), "Tracking session driver stopped");
    }

    /// Replies go out after the snapshot is published, so a caller that
    /// awaited the reply observes the new state. A stop reply waits for
    /// in-flight writes.
    fn handle_command(
        session: &mut TrackingSession,
        snapshot: &watch::Sender<SessionSnapshot>,
        stop_waiters: &mut Vec<StopWaiter>,
        command: SessionCommand,
    ) {
        trace!(command = ?command, "Session command");
        match command {
            SessionCommand::Start { target, reply } => {
                let result = session.start(target.bus_id, target.trip_id);
                snapshot.send_replace(session.snapshot());
                let _ = reply.send(result);
            }
            SessionCommand::Stop { reply } => {
                let stopped = session.stop();
                snapshot.send_replace(session.snapshot());
                if session.writes_in_flight() == 0 {
                    let _ = reply.send(stopped);
                } else {
                    debug!(
                        writes = session.writes_in_flight(),
                        "Stop waiting for in-flight writes"
                    );
                    stop_waiters.push((reply, stopped));
                }
            }
        }
    }
}

fn release_stop_waiters(stop_waiters: &mut Vec<StopWaiter>) {
    for (reply, stopped) in stop_waiters.drain(..) {
        let _ = reply.send(stopped);
    }
}
