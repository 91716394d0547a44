//! Position sampling over a device location capability.
//!
//! A [`LocationProvider`] is the raw capability the platform offers: request a
//! single fix, or register a standing watch that invokes a callback on every
//! new fix. [`PositionSampler`] wraps a provider and adds the guarantees the
//! rest of the crate relies on:
//!
//! - fixes and errors are normalized into [`Position`] / [`PositionError`]
//! - one-shot requests honor [`SamplerOptions::timeout`]
//! - at most one watch is active per sampler; beginning a new one cancels the
//!   previous one first, and dropping the sampler cancels whatever is active
//!
//! ```text
//!            request_position ──► oneshot ──► timeout ──► normalize ──► caller
//! Provider
//!            watch_position ───► callback ──────────────► normalize ──► caller
//! ```
//!
//! Providers never retry; neither does the sampler.

mod manual;
mod scripted;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::position::{Position, PositionError};

pub use manual::ManualProvider;
pub use scripted::{ScriptedFix, ScriptedProvider};

/// Default one-shot timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum age of a cached fix the provider may hand back.
pub const DEFAULT_MAX_FIX_AGE: Duration = Duration::from_secs(5);

/// Outcome of a single sampling attempt.
pub type FixResult = Result<Position, PositionError>;

/// Callback invoked by a provider for every fix of a watch.
pub type FixCallback = Box<dyn Fn(FixResult) + Send + Sync + 'static>;

/// Options passed to the provider with every request.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerOptions {
    /// Prefer precise (slower, more power hungry) fixes.
    pub high_accuracy: bool,
    /// Fail a one-shot request if no fix arrives within this window.
    pub timeout: Duration,
    /// Accept a cached fix no older than this.
    pub max_fix_age: Duration,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: DEFAULT_TIMEOUT,
            max_fix_age: DEFAULT_MAX_FIX_AGE,
        }
    }
}

/// Identifier of a provider-side watch registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

/// Platform location capability.
///
/// Implementations deliver results asynchronously: one-shot replies go
/// through the supplied channel, watch results through the callback until
/// [`clear_watch`](LocationProvider::clear_watch) is called.
pub trait LocationProvider: Send + Sync {
    /// Whether the device has any location capability.
    fn is_supported(&self) -> bool;

    /// Request a single fix. Dropping `reply` without sending means the
    /// provider gave up.
    fn request_position(&self, options: &SamplerOptions, reply: oneshot::Sender<FixResult>);

    /// Register a standing watch.
    fn watch_position(&self, options: &SamplerOptions, callback: FixCallback) -> WatchId;

    /// Cancel a watch. No delivery starts after this returns; a delivery
    /// already running on another thread may still finish, so consumers that
    /// need a hard cut-off tag what they receive.
    fn clear_watch(&self, id: WatchId);
}

/// Normalizing, single-watch wrapper around a [`LocationProvider`].
pub struct PositionSampler {
    provider: Arc<dyn LocationProvider>,
    options: SamplerOptions,
    active: Option<WatchId>,
}

impl PositionSampler {
    pub fn new(provider: Arc<dyn LocationProvider>, options: SamplerOptions) -> Self {
        Self {
            provider,
            options,
            active: None,
        }
    }

    pub fn options(&self) -> &SamplerOptions {
        &self.options
    }

    /// Take a single fix.
    pub async fn current_position(&self) -> FixResult {
        fetch_position(self.provider.as_ref(), &self.options).await
    }

    /// Take a single fix in the background and hand it to `callback`.
    ///
    /// Unlike [`current_position`](Self::current_position) this does not tie
    /// up the caller while waiting for the device; the result arrives through
    /// the callback, as with a watch.
    pub fn spawn_current_position<F>(&self, callback: F)
    where
        F: FnOnce(FixResult) + Send + 'static,
    {
        let provider = Arc::clone(&self.provider);
        let options = self.options.clone();
        tokio::spawn(async move {
            callback(fetch_position(provider.as_ref(), &options).await);
        });
    }

    /// Begin continuous sampling, replacing any watch already active.
    ///
    /// The callback receives normalized results until [`end`](Self::end) is
    /// called, `begin` is called again, or the sampler is dropped.
    pub fn begin<F>(&mut self, callback: F) -> Result<WatchId, PositionError>
    where
        F: Fn(FixResult) + Send + Sync + 'static,
    {
        if !self.provider.is_supported() {
            return Err(PositionError::Unsupported);
        }

        self.end();

        let id = self.provider.watch_position(
            &self.options,
            Box::new(move |fix| callback(fix.and_then(Position::normalize))),
        );
        debug!(watch = %id, "Continuous sampling started");
        self.active = Some(id);
        Ok(id)
    }

    /// Cancel the active watch. Returns `false` if none was active.
    pub fn end(&mut self) -> bool {
        match self.active.take() {
            Some(id) => {
                self.provider.clear_watch(id);
                debug!(watch = %id, "Continuous sampling stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_watch(&self) -> Option<WatchId> {
        self.active
    }
}

async fn fetch_position(provider: &dyn LocationProvider, options: &SamplerOptions) -> FixResult {
    if !provider.is_supported() {
        return Err(PositionError::Unsupported);
    }

    let (tx, rx) = oneshot::channel();
    provider.request_position(options, tx);

    match tokio::time::timeout(options.timeout, rx).await {
        Ok(Ok(fix)) => fix.and_then(Position::normalize),
        Ok(Err(_)) => Err(PositionError::PositionUnavailable),
        Err(_) => Err(PositionError::Timeout),
    }
}

impl Drop for PositionSampler {
    fn drop(&mut self) {
        self.end();
    }
}

impl fmt::Debug for PositionSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PositionSampler")
            .field("options", &self.options)
            .field("active", &self.active)
            .finish()
    }
}
