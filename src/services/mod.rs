//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `poller` - Feed polling loop (live and replay)
//! - `fleet_tracker` - Open trips per vehicle and trip boundaries
//! - `error_corrector` - Speed-based report filtering
//! - `interpolator` - Stop arrival time estimation
//! - `finalizer` - Ended trip pipeline and its worker pool

pub mod error_corrector;
pub mod finalizer;
pub mod fleet_tracker;
pub mod interpolator;
pub mod poller;

// Re-export commonly used types
pub use finalizer::{FinalizerPool, TripFinalizer};
pub use fleet_tracker::{ClosedTrip, FleetTracker};
pub use poller::{CycleStatus, Poller};
