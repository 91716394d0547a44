//! Location provider that replays a recorded script of fixes.
//!
//! Each watch spawns a tokio task that walks the script, sleeping for each
//! entry's delay before invoking the callback. Used for track replay from the
//! command line and for tests that need real timer behavior.
//!
//! When a [`ManualClock`] is attached, the clock is moved to each fix's
//! `captured_at` just before delivery, so time-dependent consumers (the
//! emission throttle) see track time rather than replay time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::{FixCallback, FixResult, LocationProvider, SamplerOptions, WatchId};
use crate::clock::{ManualClock, Timestamp};
use crate::position::Position;

/// One step of a replay script.
#[derive(Debug, Clone, Copy)]
pub struct ScriptedFix {
    /// Wait this long after the previous step before delivering.
    pub delay: Duration,
    pub fix: FixResult,
}

impl ScriptedFix {
    pub fn new(delay: Duration, fix: FixResult) -> Self {
        Self { delay, fix }
    }
}

/// Replays a fixed script for every watch.
pub struct ScriptedProvider {
    script: Arc<Vec<ScriptedFix>>,
    clock: Option<Arc<ManualClock>>,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<WatchId, JoinHandle<()>>>,
    finished_tx: Arc<watch::Sender<usize>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<ScriptedFix>) -> Self {
        let (finished_tx, _) = watch::channel(0);
        Self {
            script: Arc::new(script),
            clock: None,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
            finished_tx: Arc::new(finished_tx),
        }
    }

    /// Build a script from a recorded track.
    ///
    /// Delays are the gaps between consecutive `captured_at` values divided by
    /// `speedup`; gaps that run backwards are treated as zero.
    pub fn from_track(track: &[Position], speedup: f64) -> Self {
        let speedup = if speedup.is_finite() && speedup > 0.0 {
            speedup
        } else {
            1.0
        };

        let mut previous: Option<Timestamp> = None;
        let script = track
            .iter()
            .map(|position| {
                let gap = previous
                    .and_then(|prev| (position.captured_at - prev).to_std().ok())
                    .unwrap_or(Duration::ZERO);
                previous = Some(position.captured_at);
                ScriptedFix::new(gap.div_f64(speedup), Ok(*position))
            })
            .collect();

        Self::new(script)
    }

    /// Move `clock` to each fix's capture time before delivering it.
    pub fn with_clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn len(&self) -> usize {
        self.script.len()
    }

    pub fn is_empty(&self) -> bool {
        self.script.is_empty()
    }

    /// Total replay duration of the script.
    pub fn duration(&self) -> Duration {
        self.script.iter().map(|step| step.delay).sum()
    }

    /// Number of watches that have played the script to the end.
    pub fn finished(&self) -> watch::Receiver<usize> {
        self.finished_tx.subscribe()
    }
}

impl LocationProvider for ScriptedProvider {
    fn is_supported(&self) -> bool {
        true
    }

    fn request_position(&self, _options: &SamplerOptions, reply: oneshot::Sender<FixResult>) {
        let Some(first) = self.script.first().copied() else {
            // Dropping the reply reports the position as unavailable.
            return;
        };
        let clock = self.clock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(first.delay).await;
            if let (Some(clock), Ok(position)) = (&clock, &first.fix) {
                clock.set(position.captured_at);
            }
            let _ = reply.send(first.fix);
        });
    }

    fn watch_position(&self, _options: &SamplerOptions, callback: FixCallback) -> WatchId {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let script = Arc::clone(&self.script);
        let clock = self.clock.clone();
        let finished_tx = Arc::clone(&self.finished_tx);

        let handle = tokio::spawn(async move {
            for step in script.iter() {
                tokio::time::sleep(step.delay).await;
                if let (Some(clock), Ok(position)) = (&clock, &step.fix) {
                    clock.set(position.captured_at);
                }
                callback(step.fix);
            }
            finished_tx.send_modify(|count| *count += 1);
        });

        self.tasks.lock().insert(id, handle);
        id
    }

    fn clear_watch(&self, id: WatchId) {
        if let Some(handle) = self.tasks.lock().remove(&id) {
            handle.abort();
        }
    }
}

impl Drop for ScriptedProvider {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}
