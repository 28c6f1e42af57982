//! Trajectory error correction for a just-closed trip
//!
//! Each segment between consecutive reports is classified by speed as normal,
//! stationary or impossible. A trip is dirty while it has any impossible
//! segment or two stationary segments in a row; correction removes one report
//! per pass, picked by the first rule that applies, until the trip is clean.

use crate::domain::geometry::haversine_km;
use crate::domain::trip::{IgnoreReason, Trip};
use crate::domain::types::VehicleReport;
use rand::Rng;
use tracing::debug;

/// Trips shorter than this (km) are not worth matching
pub const MIN_TRIP_KM: f64 = 0.8;
/// Segment speeds above this (km/h) are GPS or reporting errors
pub const IMPOSSIBLE_KMH: f64 = 120.0;
/// Segment speeds below this (km/h) count as standing still
pub const STATIONARY_KMH: f64 = 0.1;

/// Rules 3 and 4 look this many segments in from either end
const EDGE_SEGMENTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedClass {
    Normal,
    Stationary,
    Impossible,
}

impl SpeedClass {
    pub fn from_kmh(speed: f64) -> Self {
        if speed > IMPOSSIBLE_KMH {
            SpeedClass::Impossible
        } else if speed < STATIONARY_KMH {
            SpeedClass::Stationary
        } else {
            SpeedClass::Normal
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            SpeedClass::Normal => '-',
            SpeedClass::Stationary => 'o',
            SpeedClass::Impossible => 'x',
        }
    }
}

/// Total trajectory length in km
pub fn trip_length_km(reports: &[VehicleReport]) -> f64 {
    reports
        .windows(2)
        .map(|w| haversine_km(w[0].longitude, w[0].latitude, w[1].longitude, w[1].latitude))
        .sum()
}

/// Speed (km/h) of each segment between consecutive reports
pub fn segment_speeds(reports: &[VehicleReport]) -> Vec<f64> {
    reports
        .windows(2)
        .map(|w| {
            let km = haversine_km(w[0].longitude, w[0].latitude, w[1].longitude, w[1].latitude);
            let hours = (w[1].timestamp - w[0].timestamp) / 3600.0;
            // Zero elapsed time cannot be a real movement
            if hours <= 0.0 {
                f64::INFINITY
            } else {
                km / hours
            }
        })
        .collect()
}

pub fn classify(reports: &[VehicleReport]) -> Vec<SpeedClass> {
    segment_speeds(reports).into_iter().map(SpeedClass::from_kmh).collect()
}

pub fn class_string(classes: &[SpeedClass]) -> String {
    classes.iter().map(SpeedClass::symbol).collect()
}

/// Run of identical classes: (class, first segment, length)
fn runs(classes: &[SpeedClass]) -> Vec<(SpeedClass, usize, usize)> {
    let mut runs: Vec<(SpeedClass, usize, usize)> = Vec::new();
    for (i, &class) in classes.iter().enumerate() {
        match runs.last_mut() {
            Some((c, _, len)) if *c == class => *len += 1,
            _ => runs.push((class, i, 1)),
        }
    }
    runs
}

pub fn is_dirty(classes: &[SpeedClass]) -> bool {
    runs(classes).iter().any(|&(class, _, len)| {
        class == SpeedClass::Impossible || (class == SpeedClass::Stationary && len >= 2)
    })
}

/// Index of the report to drop next.
///
/// Returns `Some` for every dirty classification; `None` only for a clean
/// or empty one.
fn fix_one<R: Rng + ?Sized>(classes: &[SpeedClass], rng: &mut R) -> Option<usize> {
    let n = classes.len();
    if n == 0 {
        return None;
    }
    let last_report = n;

    if classes[0] == SpeedClass::Stationary {
        return Some(0);
    }
    if classes[n - 1] == SpeedClass::Stationary {
        return Some(last_report);
    }
    if classes[..n.min(EDGE_SEGMENTS)].contains(&SpeedClass::Impossible) {
        return Some(0);
    }
    if classes[n.saturating_sub(EDGE_SEGMENTS)..].contains(&SpeedClass::Impossible) {
        return Some(last_report);
    }

    let runs = runs(classes);
    // Segment f joins reports f and f+1, so f+1 is the report inside the run
    if let Some(&(_, first, _)) =
        runs.iter().find(|&&(class, _, len)| class == SpeedClass::Stationary && len >= 2)
    {
        return Some(first + 1);
    }
    if let Some(&(_, first, _)) =
        runs.iter().find(|&&(class, _, len)| class == SpeedClass::Impossible && len >= 2)
    {
        return Some(first + 1);
    }
    if let Some(&(_, k, _)) = runs.iter().find(|&&(class, _, _)| class == SpeedClass::Impossible) {
        return Some(if rng.gen_bool(0.5) { k } else { k + 1 });
    }
    None
}

/// Clean the trip in place.
///
/// On success the trip's reports form a clean trajectory and
/// `speed_class_string` holds its classification. Removed reports move to
/// `ignored_reports`.
pub fn correct<R: Rng + ?Sized>(trip: &mut Trip, rng: &mut R) -> Result<(), IgnoreReason> {
    trip.length_km = trip_length_km(&trip.reports);
    if trip.length_km < MIN_TRIP_KM {
        return Err(IgnoreReason::TooShort);
    }

    let mut classes = classify(&trip.reports);
    while is_dirty(&classes) {
        trip.speed_class_string = class_string(&classes);
        if trip.reports.len() < 3 {
            return Err(IgnoreReason::CorrectedTooShort);
        }
        // Not reached while `is_dirty` holds
        let Some(index) = fix_one(&classes, rng) else {
            return Err(IgnoreReason::Uncorrectable);
        };
        debug!(
            trip_id = %trip.trip_id,
            classes = %trip.speed_class_string,
            dropped = %index,
            "report_ignored"
        );
        trip.ignore_report(index);
        trip.length_km = trip_length_km(&trip.reports);
        classes = classify(&trip.reports);
    }

    trip.speed_class_string = class_string(&classes);
    Ok(())
}
