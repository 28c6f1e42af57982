//! Stop arrival time estimation along a matched trip
//!
//! Waypoints place each matched report on the matched line as
//! `(time, measure)`; stops are placed on the same line as
//! `(measure, distance)`. A stop's time is interpolated between the two
//! waypoints that bracket its measure.

use crate::domain::geometry::project;
use crate::domain::types::{StopMeasure, StopPoint, VehicleReport, Waypoint};
use crate::io::map_match::Tracepoint;
use rustc_hash::FxHashMap;
use tracing::debug;

/// Stops further than this (metres) from the matched line are not trusted
pub const MAX_STOP_DISTANCE_M: f64 = 20.0;

#[derive(Debug, Clone, PartialEq)]
pub struct StopTime {
    pub stop_id: String,
    pub time: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interpolation {
    pub stop_times: Vec<StopTime>,
    /// Completion counter; seeded at 1
    pub count: usize,
}

impl Interpolation {
    /// Whether the trip has enough stop times to be finished
    pub fn is_complete(&self) -> bool {
        self.count > 1
    }
}

/// Pair each matched tracepoint with the time of the report it came from.
///
/// Unmatched tracepoints and points that cannot be placed on the line are
/// skipped.
pub fn build_waypoints(
    geometry: &[[f64; 2]],
    tracepoints: &[Option<Tracepoint>],
    reports: &[VehicleReport],
) -> Vec<Waypoint> {
    if tracepoints.len() != reports.len() {
        debug!(
            tracepoints = %tracepoints.len(),
            reports = %reports.len(),
            "tracepoint_count_mismatch"
        );
    }

    tracepoints
        .iter()
        .zip(reports)
        .filter_map(|(tracepoint, report)| {
            let Some(tracepoint) = tracepoint else {
                debug!(sequence = %report.sequence, "tracepoint_unmatched");
                return None;
            };
            let Some(projection) = project(geometry, tracepoint.location) else {
                debug!(sequence = %report.sequence, "waypoint_projection_failed");
                return None;
            };
            Some(Waypoint { time: report.timestamp, measure: projection.measure_m })
        })
        .collect()
}

/// Place the route's stops on the matched line
pub fn measure_stops(geometry: &[[f64; 2]], stops: &[StopPoint]) -> FxHashMap<String, StopMeasure> {
    stops
        .iter()
        .filter_map(|stop| {
            let projection = project(geometry, [stop.longitude, stop.latitude])?;
            Some((
                stop.stop_id.clone(),
                StopMeasure {
                    sequence: stop.sequence,
                    measure: projection.measure_m,
                    distance: projection.offset_m,
                },
            ))
        })
        .collect()
}

/// Estimate a time for every trusted stop that the waypoints bracket
pub fn interpolate(waypoints: &[Waypoint], stops: &FxHashMap<String, StopMeasure>) -> Interpolation {
    let mut candidates: Vec<(&String, &StopMeasure)> =
        stops.iter().filter(|(_, stop)| stop.distance < MAX_STOP_DISTANCE_M).collect();
    candidates.sort_by(|a, b| a.1.sequence.cmp(&b.1.sequence).then_with(|| a.0.cmp(b.0)));

    let mut stop_times = Vec::with_capacity(candidates.len());
    let mut count = 1;
    let mut cursor = 0;

    for (stop_id, stop) in candidates {
        while cursor + 1 < waypoints.len() && waypoints[cursor + 1].measure < stop.measure {
            cursor += 1;
        }
        let Some(first) = waypoints.get(cursor) else {
            break;
        };

        // A stop needs a bracketing pair even when it sits on a waypoint
        let Some(second) = waypoints.get(cursor + 1) else {
            continue;
        };
        let time = if stop.measure == first.measure {
            first.time
        } else if first.measure <= stop.measure && stop.measure <= second.measure {
            first.time
                + (stop.measure - first.measure) / (second.measure - first.measure)
                    * (second.time - first.time)
        } else {
            continue;
        };

        stop_times.push(StopTime { stop_id: stop_id.clone(), time });
        count += 1;
    }

    Interpolation { stop_times, count }
}
