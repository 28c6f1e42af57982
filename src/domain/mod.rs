//! Domain models - trips, reports and geometry
//!
//! This module contains the canonical data types used throughout the system:
//! - `Trip` - one observed run of a vehicle on a route/direction
//! - `VehicleReport` / `RawPositionReport` - positions as owned by a trip / as read from the feed
//! - `Waypoint` / `StopMeasure` - positions placed on a matched line
//! - `geometry` - great-circle distance and linear referencing

pub mod geometry;
pub mod trip;
pub mod types;

// Re-export commonly used types at module level
pub use trip::{IgnoreReason, ResolvedRoute, Trip, TripDisposition, TripRecord};
pub use types::{BlockId, CloseReason, FeedSnapshot, RawPositionReport, TripId, VehicleId, VehicleReport};
