//! Route search over bus stops.
//!
//! A bus's complete route is its origin, its intermediate stops and its
//! destination, in travel order. Stop names are compared case-insensitively
//! after trimming.
//!
//! | query        | matches when                                          |
//! |--------------|-------------------------------------------------------|
//! | from only    | some stop equals `from`                               |
//! | to only      | some stop equals `to`                                 |
//! | from and to  | both present and `from` comes before `to`             |
//! | neither      | nothing matches                                       |

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{BusSnapshot, BusStatus};
use crate::store::{BusFilter, StoreResult, TransitStore};

/// Number of searches remembered by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 5;

/// A from/to stop query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RouteQuery {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
}

impl RouteQuery {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Neither field has any text.
    pub fn is_empty(&self) -> bool {
        self.from.trim().is_empty() && self.to.trim().is_empty()
    }

    /// Both fields have text.
    pub fn is_complete(&self) -> bool {
        !self.from.trim().is_empty() && !self.to.trim().is_empty()
    }

    /// Whether `bus` serves this query. Ignores bus status.
    pub fn matches(&self, bus: &BusSnapshot) -> bool {
        let route: Vec<String> = bus
            .complete_route()
            .into_iter()
            .map(normalize_stop)
            .collect();
        let from = normalize_stop(&self.from);
        let to = normalize_stop(&self.to);
        let position = |stop: &str| route.iter().position(|s| s == stop);

        match (from.is_empty(), to.is_empty()) {
            (true, true) => false,
            (false, true) => position(&from).is_some(),
            (true, false) => position(&to).is_some(),
            (false, false) => match (position(&from), position(&to)) {
                (Some(f), Some(t)) => f < t,
                _ => false,
            },
        }
    }
}

fn normalize_stop(stop: &str) -> String {
    stop.trim().to_lowercase()
}

/// Active buses in `buses` that serve `query`, in input order.
pub fn search<'a>(buses: &'a [BusSnapshot], query: &RouteQuery) -> Vec<&'a BusSnapshot> {
    if query.is_empty() {
        return Vec::new();
    }

    buses
        .iter()
        .filter(|bus| bus.status == BusStatus::Active && query.matches(bus))
        .collect()
}

/// Search the active buses in `store`, ordered by bus number.
pub async fn search_store(
    store: &dyn TransitStore,
    query: &RouteQuery,
) -> StoreResult<Vec<BusSnapshot>> {
    if query.is_empty() {
        return Ok(Vec::new());
    }

    let buses = store.list_buses(BusFilter::ActiveOnly).await?;
    let found: Vec<BusSnapshot> = search(&buses, query).into_iter().cloned().collect();
    debug!(
        from = %query.from,
        to = %query.to,
        candidates = buses.len(),
        matches = found.len(),
        "Route search"
    );
    Ok(found)
}

// =============================================================================
// History
// =============================================================================

/// Errors loading or saving search history.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Failed to access search history: {0}")]
    Io(#[from] io::Error),

    #[error("Search history is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

/// Recent complete searches, most recent first, without duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHistory {
    entries: VecDeque<RouteQuery>,
    limit: usize,
}

impl Default for SearchHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl SearchHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit),
            limit,
        }
    }

    /// Remember `query` if both fields are filled in.
    ///
    /// A repeated query moves to the front. Returns `true` if the query was
    /// recorded.
    pub fn record(&mut self, query: &RouteQuery) -> bool {
        if !query.is_complete() || self.limit == 0 {
            return false;
        }

        let entry = RouteQuery::new(query.from.trim(), query.to.trim());
        self.entries.retain(|e| *e != entry);
        self.entries.push_front(entry);
        self.entries.truncate(self.limit);
        true
    }

    pub fn entries(&self) -> impl Iterator<Item = &RouteQuery> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Load history from a JSON file. A missing file is an empty history.
    pub fn load(path: &Path, limit: usize) -> Result<Self, HistoryError> {
        let mut history = Self::new(limit);
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(history),
            Err(e) => return Err(e.into()),
        };

        let saved: Vec<RouteQuery> = serde_json::from_str(&contents)?;
        if saved.len() > limit {
            warn!(
                path = %path.display(),
                saved = saved.len(),
                limit,
                "Search history longer than limit, truncating"
            );
        }
        history.entries = saved.into_iter().take(limit).collect();
        Ok(history)
    }

    /// Write history to a JSON file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), HistoryError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        fs::write(path, json)?;
        Ok(())
    }
}
