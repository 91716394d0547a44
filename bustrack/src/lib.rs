//! BusTrack - live bus tracking core
//!
//! Conductors broadcast the GPS position of their bus; passengers search
//! routes and follow a live marker. Accounts, buses, trips and location pings
//! live in an external backend, reached through the collaborator traits in
//! [`store`], [`feed`] and [`auth`].
//!
//! # Conductor side
//!
//! ```text
//! LocationProvider ─► PositionSampler ─► TrackingSession ─► EmissionThrottle ─► TransitStore
//!                                            ▲
//!                      TripController ───────┘ (via SessionHandle)
//! ```
//!
//! # Passenger side
//!
//! ```text
//! TransitStore::latest_location ─┐
//!                                ├─► LiveView::apply ─► MapMarker
//! RealtimeFeed::subscribe ───────┘
//! ```
//!
//! Route search and its history live in [`route_search`].

pub mod auth;
pub mod clock;
pub mod config;
pub mod feed;
pub mod live_view;
pub mod logging;
pub mod model;
pub mod notify;
pub mod position;
pub mod route_search;
pub mod sampler;
pub mod session;
pub mod store;
pub mod throttle;
pub mod trip;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use live_view::{DisplayState, LiveView, LiveViewMessage, LiveViewService, MapMarker};
pub use model::{BusSnapshot, BusStatus, LocationRecord, Trip};
pub use position::{Position, PositionError};
pub use sampler::{LocationProvider, PositionSampler, SamplerOptions};
pub use session::{SessionDriver, SessionHandle, SessionStatus, TrackingSession};
pub use store::{MemoryStore, TransitStore};
pub use throttle::EmissionThrottle;
pub use trip::{TripController, TripError};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
