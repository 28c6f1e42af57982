//! Shared types for the trip reconstruction pipeline

use serde::{Deserialize, Serialize};

/// Vehicle identifier as reported by the feed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(pub String);

impl VehicleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for VehicleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Newtype wrapper for internally assigned trip IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct TripId(pub u64);

impl std::fmt::Display for TripId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for block IDs (a run of trips by one vehicle)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct BlockId(pub u64);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A position report as it arrives from the feed, before route resolution
#[derive(Debug, Clone, PartialEq)]
pub struct RawPositionReport {
    pub vehicle_id: VehicleId,
    /// False when the feed marks the vehicle as not predictable / not on a route
    pub operating: bool,
    pub route_id: Option<String>,
    pub direction_id: Option<String>,
    /// External (GTFS) trip identifier, where the feed provides one
    pub trip_id: Option<String>,
    pub longitude: f64,
    pub latitude: f64,
    /// Observation time, epoch seconds
    pub observed_at: f64,
}

/// One polling cycle's worth of feed data
#[derive(Debug, Clone, Default)]
pub struct FeedSnapshot {
    /// The feed's own timestamp; unchanged between reads means a duplicate snapshot
    pub feed_timestamp: u64,
    /// Server time used for timeout decisions, epoch seconds
    pub server_time: f64,
    pub reports: Vec<RawPositionReport>,
}

/// One observed position belonging to a trip
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleReport {
    pub longitude: f64,
    pub latitude: f64,
    /// Epoch seconds
    pub timestamp: f64,
    pub sequence: u32,
}

/// A point on the matched trajectory: when the vehicle was at which measure
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    pub time: f64,
    /// Metres along the matched line
    pub measure: f64,
}

/// A stop of the route pattern, before it is placed on a matched line
#[derive(Debug, Clone, PartialEq)]
pub struct StopPoint {
    pub stop_id: String,
    pub sequence: u32,
    pub longitude: f64,
    pub latitude: f64,
}

/// A stop placed on a trip's matched line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopMeasure {
    pub sequence: u32,
    /// Metres along the matched line
    pub measure: f64,
    /// Metres from the stop to the matched line
    pub distance: f64,
}

/// Why the fleet tracker closed a trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    NotSeen,
    ChangedTrip,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::NotSeen => "not seen",
            CloseReason::ChangedTrip => "changed trip",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
