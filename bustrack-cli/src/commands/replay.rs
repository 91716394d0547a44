//! Replay command - run a recorded track through a conductor session.
//!
//! The track is a JSON array of position fixes. Each fix is delivered after
//! the gap to the previous one (divided by `--speedup`), and the session's
//! clock follows the fixes' capture times, so throttling behaves as it did on
//! the road. Records land in an in-memory store and are printed at the end.

use std::path::PathBuf;
use std::sync::Arc;

use bustrack::auth::{Identity, StaticAuth, UserRole};
use bustrack::clock::ManualClock;
use bustrack::model::{BusSnapshot, LocationRecord};
use bustrack::notify::{Notifier, TracingNotifier};
use bustrack::sampler::{PositionSampler, ScriptedProvider};
use bustrack::session::{SessionDriver, SessionHandle, SessionStats, TrackingSession};
use bustrack::store::MemoryStore;
use bustrack::trip::TripController;
use bustrack::Position;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::common::{format_record, read_json, write_json};
use crate::error::CliError;
use crate::runner::CliRunner;

/// Arguments for the replay command.
pub struct ReplayArgs {
    pub track: PathBuf,
    pub bus: String,
    pub trip: Option<String>,
    pub speedup: f64,
    pub min_interval_ms: Option<u64>,
    pub output: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

/// Outcome of a replay.
#[derive(Debug)]
pub struct ReplaySummary {
    pub stats: SessionStats,
    pub records: Vec<LocationRecord>,
    pub trip_id: Option<String>,
    pub interrupted: bool,
}

/// Run the replay command.
pub fn run(args: ReplayArgs) -> Result<(), CliError> {
    let runner = CliRunner::new(args.config.as_deref())?;
    runner.log_startup("replay");

    let track: Vec<Position> = read_json(&args.track)?;
    if track.is_empty() {
        return Err(CliError::Replay(format!(
            "{} contains no fixes",
            args.track.display()
        )));
    }
    if !(args.speedup.is_finite() && args.speedup > 0.0) {
        return Err(CliError::Config(format!(
            "--speedup must be a positive number, got {}",
            args.speedup
        )));
    }

    let mut session_config = runner.config().tracking.session_config();
    if let Some(ms) = args.min_interval_ms {
        session_config.min_interval = std::time::Duration::from_millis(ms);
    }
    let options = runner.config().tracking.sampler_options();

    println!("BusTrack Replay v{}", bustrack::VERSION);
    println!("==================");
    println!();
    println!("Track:        {} ({} fixes)", args.track.display(), track.len());
    println!("Bus:          {}", args.bus);
    println!("Speedup:      {}x", args.speedup);
    println!(
        "Min interval: {} ms",
        session_config.min_interval.as_millis()
    );
    println!();

    let runtime = runner.runtime()?;
    let summary = runtime.block_on(async {
        let clock = Arc::new(ManualClock::new(track[0].captured_at));
        let provider = Arc::new(
            ScriptedProvider::from_track(&track, args.speedup).with_clock(clock.clone()),
        );
        let store = Arc::new(MemoryStore::with_buses([BusSnapshot::new(
            args.bus.clone(),
            args.bus.clone(),
            "Replay",
        )]));
        let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);

        let session = TrackingSession::new(
            PositionSampler::new(provider.clone(), options),
            store.clone(),
            notifier.clone(),
            clock.clone(),
            session_config,
        );
        let (driver, handle) = SessionDriver::new(session);
        let shutdown = CancellationToken::new();
        let driver_task = tokio::spawn(driver.run(shutdown.clone()));

        let result = match args.trip.clone() {
            Some(trip_id) => {
                replay_with_trip_id(&handle, &provider, &args.bus, trip_id, track.len()).await
            }
            None => {
                let auth = Arc::new(StaticAuth::signed_in(Identity::new(
                    "replay",
                    UserRole::Conductor,
                )));
                let controller =
                    TripController::new(store.clone(), auth, handle.clone(), notifier, clock);
                replay_as_trip(controller, &handle, &provider, &args.bus, track.len()).await
            }
        };

        shutdown.cancel();
        if let Err(e) = driver_task.await {
            warn!(error = %e, "Session driver task failed");
        }

        result.map(|(trip_id, interrupted)| ReplaySummary {
            stats: handle.snapshot().stats,
            records: store.locations(),
            trip_id,
            interrupted,
        })
    })?;

    print_summary(&summary);

    if let Some(output) = &args.output {
        write_json(output, &summary.records)?;
        println!();
        println!("Records written to {}", output.display());
    }

    Ok(())
}

/// Track under a caller-supplied trip id, without touching trip rows.
async fn replay_with_trip_id(
    handle: &SessionHandle,
    provider: &ScriptedProvider,
    bus_id: &str,
    trip_id: String,
    fixes: usize,
) -> Result<(Option<String>, bool), CliError> {
    handle.start(bus_id, Some(trip_id.clone())).await?;
    let interrupted = wait_for_replay(handle, provider, fixes).await;
    handle.stop().await?;
    Ok((Some(trip_id), interrupted))
}

/// Open a trip for the bus, track it, then end it.
async fn replay_as_trip(
    mut controller: TripController,
    handle: &SessionHandle,
    provider: &ScriptedProvider,
    bus_id: &str,
    fixes: usize,
) -> Result<(Option<String>, bool), CliError> {
    let trip = controller.start_trip(bus_id).await?;
    let interrupted = wait_for_replay(handle, provider, fixes).await;
    controller.end_trip().await?;
    Ok((Some(trip.id), interrupted))
}

/// Wait until the session has seen every fix, or Ctrl+C.
async fn wait_for_replay(handle: &SessionHandle, provider: &ScriptedProvider, fixes: usize) -> bool {
    let mut finished = provider.finished();
    let mut snapshots = handle.subscribe();
    let fixes = fixes as u64;

    let done = async {
        // Either wait can only fail if its sender is gone, which means the
        // replay is over anyway.
        let _ = finished.wait_for(|count| *count > 0).await;
        let _ = snapshots.wait_for(|s| s.stats.received >= fixes).await;
    };

    tokio::select! {
        _ = done => {
            info!(fixes, "Replay complete");
            false
        }
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("Interrupted, stopping replay...");
            true
        }
    }
}

fn print_summary(summary: &ReplaySummary) {
    let stats = &summary.stats;

    println!("Replay Summary");
    println!("──────────────");
    if let Some(trip_id) = &summary.trip_id {
        println!("  Trip:            {}", trip_id);
    }
    println!("  Fixes received:  {}", stats.received);
    println!("  Records written: {}", summary.records.len());
    println!("  Throttled:       {}", stats.throttled);
    println!("  Sampling errors: {}", stats.sampling_errors);
    println!("  Write failures:  {}", stats.write_failures);
    if summary.interrupted {
        println!("  (interrupted before the end of the track)");
    }

    if !summary.records.is_empty() {
        println!();
        println!("Records");
        println!("───────");
        for record in &summary.records {
            println!("  {}", format_record(record));
        }
    }
}
