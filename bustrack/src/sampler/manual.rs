//! Hand-driven location provider.
//!
//! Fixes are pushed in by the caller with [`ManualProvider::deliver`], which
//! invokes every registered watch callback synchronously. Useful for tests
//! and for embedding hosts that receive fixes from elsewhere (e.g. a GPS
//! daemon) and want to feed them into a tracking session.
//!
//! Callbacks run under the watch table's read lock, so
//! [`clear_watch`](LocationProvider::clear_watch) waits for a delivery in
//! progress and no callback runs after it returns. Callbacks must not call
//! back into the provider.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use super::{FixCallback, FixResult, LocationProvider, SamplerOptions, WatchId};

/// Location provider whose fixes are delivered by hand.
pub struct ManualProvider {
    supported: bool,
    next_id: AtomicU64,
    watches: RwLock<HashMap<WatchId, FixCallback>>,
    pending: Mutex<Vec<oneshot::Sender<FixResult>>>,
    queued: Mutex<VecDeque<FixResult>>,
    last_options: Mutex<Option<SamplerOptions>>,
}

impl ManualProvider {
    pub fn new() -> Self {
        Self::with_support(true)
    }

    /// A provider for a device without location capability.
    pub fn unsupported() -> Self {
        Self::with_support(false)
    }

    fn with_support(supported: bool) -> Self {
        Self {
            supported,
            next_id: AtomicU64::new(1),
            watches: RwLock::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            queued: Mutex::new(VecDeque::new()),
            last_options: Mutex::new(None),
        }
    }

    /// Deliver a fix to every active watch and every pending one-shot request.
    ///
    /// Returns the number of receivers the fix reached.
    pub fn deliver(&self, fix: FixResult) -> usize {
        let pending: Vec<_> = self.pending.lock().drain(..).collect();

        let mut reached = 0;
        {
            let watches = self.watches.read();
            for callback in watches.values() {
                callback(fix);
                reached += 1;
            }
        }
        for reply in pending {
            if reply.send(fix).is_ok() {
                reached += 1;
            }
        }
        reached
    }

    /// Answer the next one-shot request immediately with `fix`.
    pub fn queue_one_shot(&self, fix: FixResult) {
        self.queued.lock().push_back(fix);
    }

    pub fn active_watch_count(&self) -> usize {
        self.watches.read().len()
    }

    /// Options passed with the most recent request or watch.
    pub fn last_options(&self) -> Option<SamplerOptions> {
        self.last_options.lock().clone()
    }
}

impl Default for ManualProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationProvider for ManualProvider {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn request_position(&self, options: &SamplerOptions, reply: oneshot::Sender<FixResult>) {
        *self.last_options.lock() = Some(options.clone());
        match self.queued.lock().pop_front() {
            Some(fix) => {
                let _ = reply.send(fix);
            }
            None => self.pending.lock().push(reply),
        }
    }

    fn watch_position(&self, options: &SamplerOptions, callback: FixCallback) -> WatchId {
        *self.last_options.lock() = Some(options.clone());
        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.watches.write().insert(id, callback);
        id
    }

    fn clear_watch(&self, id: WatchId) {
        self.watches.write().remove(&id);
    }
}
