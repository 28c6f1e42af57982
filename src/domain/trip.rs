//! Trip data model: one continuous run of a vehicle on a route/direction

use crate::domain::types::{BlockId, StopMeasure, TripId, VehicleId, VehicleReport, Waypoint};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Route and direction a report was resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub route_id: String,
    pub direction_id: String,
    /// External trip identifier, when the feed carries one
    pub external_trip_id: Option<String>,
}

/// Why a trip was excluded from further processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IgnoreReason {
    TooShort,
    CorrectedTooShort,
    /// No fix rule applied to a dirty classification. Every dirty class
    /// string matches at least one rule, so correction does not produce this.
    Uncorrectable,
    OneStopTime,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::TooShort => "too short",
            IgnoreReason::CorrectedTooShort => "error processing made too short",
            IgnoreReason::Uncorrectable => "uncorrectable errors",
            IgnoreReason::OneStopTime => "only one stop time estimated",
        }
    }
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Problems that flag (but keep) a trip
pub const PROBLEM_MATCH: &str = "match problem";
pub const PROBLEM_MULTIPLE_MATCHINGS: &str = "more than one match segment";

/// Final state of a trip after finalization
#[derive(Debug, Clone, PartialEq)]
pub enum TripDisposition {
    /// Stored only; matching is disabled
    Saved,
    /// Discarded with a reason; never matched or interpolated
    Ignored(IgnoreReason),
    /// Kept with a noted problem; processing stopped
    Flagged(String),
    /// Stop times interpolated and trip marked complete
    Finished { stop_times: usize },
}

impl TripDisposition {
    pub fn as_str(&self) -> &str {
        match self {
            TripDisposition::Saved => "saved",
            TripDisposition::Ignored(reason) => reason.as_str(),
            TripDisposition::Flagged(problem) => problem,
            TripDisposition::Finished { .. } => "finished",
        }
    }
}

/// An observed trip and everything derived from it during finalization
#[derive(Debug, Clone)]
pub struct Trip {
    pub trip_id: TripId,
    pub block_id: BlockId,
    pub route_id: String,
    pub direction_id: String,
    pub external_trip_id: Option<String>,
    pub vehicle_id: VehicleId,
    /// Observation time of the latest report, epoch seconds
    pub last_seen: f64,
    /// Number of reports appended so far
    pub sequence: u32,
    /// Strictly ascending by timestamp
    pub reports: Vec<VehicleReport>,
    /// Reports removed by error correction, kept for diagnostics
    pub ignored_reports: Vec<VehicleReport>,
    pub speed_class_string: String,
    /// Total trajectory length in km, as of the last speed computation
    pub length_km: f64,
    pub problems: SmallVec<[String; 2]>,
    pub match_confidence: Option<f64>,
    /// Matched line as `[lon, lat]` pairs
    pub match_geometry: Option<Vec<[f64; 2]>>,
    pub waypoints: Vec<Waypoint>,
    pub stops: FxHashMap<String, StopMeasure>,
}

impl Trip {
    /// Open a new trip with its first report.
    ///
    /// # Example
    ///
    /// ```
    /// use transit_trips::domain::trip::{ResolvedRoute, Trip};
    /// use transit_trips::domain::types::{BlockId, TripId, VehicleId};
    ///
    /// let route = ResolvedRoute {
    ///     route_id: "R1".to_string(),
    ///     direction_id: "0".to_string(),
    ///     external_trip_id: None,
    /// };
    /// let trip = Trip::new(TripId(1), BlockId(1), VehicleId::new("V1"), &route, -79.4, 43.6, 100.0);
    /// assert_eq!(trip.reports.len(), 1);
    /// assert_eq!(trip.last_seen, 100.0);
    /// ```
    pub fn new(
        trip_id: TripId,
        block_id: BlockId,
        vehicle_id: VehicleId,
        route: &ResolvedRoute,
        longitude: f64,
        latitude: f64,
        observed_at: f64,
    ) -> Self {
        let mut trip = Self::empty(trip_id, block_id, vehicle_id, route, observed_at);
        trip.push_report(longitude, latitude, observed_at);
        trip
    }

    /// Rebuild a trip from its stored record
    pub fn load(record: TripRecord) -> Self {
        let route = ResolvedRoute {
            route_id: record.route_id,
            direction_id: record.direction_id,
            external_trip_id: record.external_trip_id,
        };
        let mut trip =
            Self::empty(record.trip_id, record.block_id, record.vehicle_id, &route, record.last_seen);
        trip.sequence = record
            .reports
            .iter()
            .chain(&record.ignored_reports)
            .map(|r| r.sequence)
            .max()
            .unwrap_or(0);
        trip.reports = record.reports;
        trip.ignored_reports = record.ignored_reports;
        trip
    }

    fn empty(
        trip_id: TripId,
        block_id: BlockId,
        vehicle_id: VehicleId,
        route: &ResolvedRoute,
        last_seen: f64,
    ) -> Self {
        Self {
            trip_id,
            block_id,
            route_id: route.route_id.clone(),
            direction_id: route.direction_id.clone(),
            external_trip_id: route.external_trip_id.clone(),
            vehicle_id,
            last_seen,
            sequence: 0,
            reports: Vec::with_capacity(64),
            ignored_reports: Vec::new(),
            speed_class_string: String::new(),
            length_km: 0.0,
            problems: SmallVec::new(),
            match_confidence: None,
            match_geometry: None,
            waypoints: Vec::new(),
            stops: FxHashMap::default(),
        }
    }

    /// Append a report, advancing `last_seen` and the sequence counter.
    ///
    /// Returns false (and appends nothing) if the report is not strictly newer
    /// than the latest one.
    pub fn push_report(&mut self, longitude: f64, latitude: f64, observed_at: f64) -> bool {
        if let Some(last) = self.reports.last() {
            if observed_at <= last.timestamp {
                return false;
            }
        }
        self.sequence += 1;
        self.reports.push(VehicleReport {
            longitude,
            latitude,
            timestamp: observed_at,
            sequence: self.sequence,
        });
        self.last_seen = observed_at;
        true
    }

    /// Move the report at `index` to `ignored_reports`
    pub fn ignore_report(&mut self, index: usize) {
        let report = self.reports.remove(index);
        self.ignored_reports.push(report);
    }

    /// Record that something undesirable happened
    pub fn flag(&mut self, problem: &str) {
        self.problems.push(problem.to_string());
    }

    /// Whether this trip continues under `route` given the identity rule.
    ///
    /// Trip identity falls back to route and direction when either side has
    /// no external trip id.
    pub fn same_identity(&self, route: &ResolvedRoute, by_trip_id: bool) -> bool {
        match (&self.external_trip_id, &route.external_trip_id) {
            (Some(ours), Some(theirs)) if by_trip_id => ours == theirs,
            _ => self.route_id == route.route_id && self.direction_id == route.direction_id,
        }
    }

    /// Snapshot suitable for storage
    pub fn to_record(&self) -> TripRecord {
        TripRecord {
            trip_id: self.trip_id,
            block_id: self.block_id,
            vehicle_id: self.vehicle_id.clone(),
            route_id: self.route_id.clone(),
            direction_id: self.direction_id.clone(),
            external_trip_id: self.external_trip_id.clone(),
            last_seen: self.last_seen,
            reports: self.reports.clone(),
            ignored_reports: self.ignored_reports.clone(),
        }
    }
}

/// Stored form of a trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripRecord {
    pub trip_id: TripId,
    pub block_id: BlockId,
    pub vehicle_id: VehicleId,
    pub route_id: String,
    pub direction_id: String,
    #[serde(default)]
    pub external_trip_id: Option<String>,
    pub last_seen: f64,
    pub reports: Vec<VehicleReport>,
    #[serde(default)]
    pub ignored_reports: Vec<VehicleReport>,
}
