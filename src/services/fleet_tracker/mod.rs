//! Fleet state machine and trip segmentation
//!
//! The FleetTracker owns the map of open trips keyed by vehicle and is the
//! only place trips are opened or closed. Each `ingest` call runs entirely
//! under one exclusive lock, so no reader ever observes a half-applied cycle.

#[cfg(test)]
mod tests;

use crate::domain::trip::{ResolvedRoute, Trip};
use crate::domain::types::{
    BlockId, CloseReason, FeedSnapshot, RawPositionReport, TripId, VehicleId,
};
use crate::infra::config::TripIdentity;
use crate::infra::metrics::Metrics;
use crate::io::route_catalog::{RouteCatalog, SharedCatalog};
use crate::io::store::IdAllocator;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A trip removed from the fleet this cycle
#[derive(Debug)]
pub struct ClosedTrip {
    pub trip: Trip,
    pub reason: CloseReason,
}

#[derive(Debug, Default)]
struct FleetState {
    trips: FxHashMap<VehicleId, Trip>,
    /// Feed timestamp of the last snapshot applied
    last_feed_timestamp: Option<u64>,
}

/// Tracks which vehicles are mid-trip
pub struct FleetTracker {
    fleet: Mutex<FleetState>,
    timeout_secs: f64,
    identity: TripIdentity,
    catalog: SharedCatalog,
    ids: Arc<dyn IdAllocator>,
    metrics: Arc<Metrics>,
}

impl FleetTracker {
    pub fn new(
        timeout_secs: u64,
        identity: TripIdentity,
        catalog: SharedCatalog,
        ids: Arc<dyn IdAllocator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            fleet: Mutex::new(FleetState::default()),
            timeout_secs: timeout_secs as f64,
            identity,
            catalog,
            ids,
            metrics,
        }
    }

    /// Apply one feed snapshot and return the trips that ended.
    ///
    /// A snapshot whose feed timestamp has not advanced is ignored.
    pub fn ingest(&self, snapshot: &FeedSnapshot) -> Vec<ClosedTrip> {
        let mut state = self.fleet.lock();

        if state.last_feed_timestamp.is_some_and(|last| snapshot.feed_timestamp <= last) {
            self.metrics.record_duplicate_cycle();
            debug!(feed_timestamp = %snapshot.feed_timestamp, "duplicate_feed_snapshot");
            return Vec::new();
        }
        state.last_feed_timestamp = Some(snapshot.feed_timestamp);
        self.metrics.record_cycle();

        let catalog = self.catalog.read();
        let mut closed = Vec::new();

        // Timeouts first, against the server clock
        let expired: Vec<VehicleId> = state
            .trips
            .iter()
            .filter(|(_, trip)| snapshot.server_time - trip.last_seen > self.timeout_secs)
            .map(|(vehicle_id, _)| vehicle_id.clone())
            .collect();
        let mut timed_out: FxHashMap<VehicleId, f64> = FxHashMap::default();
        for vehicle_id in expired {
            if let Some(trip) = self.close(&mut state, &vehicle_id, CloseReason::NotSeen) {
                timed_out.insert(vehicle_id, trip.trip.last_seen);
                closed.push(trip);
            }
        }

        for report in &snapshot.reports {
            if !report.operating {
                if let Some(trip) = self.close(&mut state, &report.vehicle_id, CloseReason::NotSeen) {
                    closed.push(trip);
                }
                continue;
            }

            // A vehicle just timed out may still echo its old position
            if timed_out.get(&report.vehicle_id).is_some_and(|&last| report.observed_at <= last) {
                self.metrics.record_report_stale();
                debug!(vehicle_id = %report.vehicle_id, "stale_report_dropped");
                continue;
            }

            self.apply_report(&mut state, &catalog, report, &mut closed);
        }

        self.metrics.set_fleet_size(state.trips.len());
        closed
    }

    fn apply_report(
        &self,
        state: &mut FleetState,
        catalog: &RouteCatalog,
        report: &RawPositionReport,
        closed: &mut Vec<ClosedTrip>,
    ) {
        let Some(route) = catalog.resolve(report) else {
            self.metrics.record_report_unresolved();
            debug!(
                vehicle_id = %report.vehicle_id,
                trip_id = ?report.trip_id,
                route_id = ?report.route_id,
                "report_unresolved"
            );
            return;
        };

        let by_trip_id = self.identity == TripIdentity::Trip;
        let open = state
            .trips
            .get(&report.vehicle_id)
            .map(|t| (t.same_identity(&route, by_trip_id), t.last_seen));
        let block_id = match open {
            Some((true, _)) => {
                self.append(state, report);
                return;
            }
            Some((false, last_seen)) if report.observed_at <= last_seen => {
                // Only a newer report can end the open trip
                self.metrics.record_report_stale();
                debug!(
                    vehicle_id = %report.vehicle_id,
                    observed_at = %report.observed_at,
                    "stale_report_dropped"
                );
                return;
            }
            Some((false, _)) => {
                // Identity changed: the new trip continues the old one's block
                let Some(ended) = self.close(state, &report.vehicle_id, CloseReason::ChangedTrip)
                else {
                    return;
                };
                let block_id = ended.trip.block_id;
                closed.push(ended);
                Some(block_id)
            }
            None => None,
        };

        self.open(state, report, &route, block_id);
    }

    fn append(&self, state: &mut FleetState, report: &RawPositionReport) {
        let Some(trip) = state.trips.get_mut(&report.vehicle_id) else {
            return;
        };
        if trip.push_report(report.longitude, report.latitude, report.observed_at) {
            self.metrics.record_report_ingested();
        } else {
            self.metrics.record_report_stale();
            debug!(
                vehicle_id = %report.vehicle_id,
                trip_id = %trip.trip_id,
                observed_at = %report.observed_at,
                "stale_report_dropped"
            );
        }
    }

    fn open(
        &self,
        state: &mut FleetState,
        report: &RawPositionReport,
        route: &ResolvedRoute,
        block_id: Option<BlockId>,
    ) {
        let ids = self.ids.next_trip_id().and_then(|trip_id| {
            let block_id = match block_id {
                Some(block_id) => block_id,
                None => self.ids.next_block_id()?,
            };
            Ok((trip_id, block_id))
        });
        let (trip_id, block_id) = match ids {
            Ok(ids) => ids,
            Err(e) => {
                warn!(vehicle_id = %report.vehicle_id, error = %e, "trip_id_allocation_failed");
                return;
            }
        };

        let trip = Trip::new(
            trip_id,
            block_id,
            report.vehicle_id.clone(),
            route,
            report.longitude,
            report.latitude,
            report.observed_at,
        );
        info!(
            trip_id = %trip_id,
            block_id = %block_id,
            vehicle_id = %report.vehicle_id,
            route_id = %route.route_id,
            direction_id = %route.direction_id,
            "trip_opened"
        );
        self.metrics.record_trip_opened();
        self.metrics.record_report_ingested();
        state.trips.insert(report.vehicle_id.clone(), trip);
    }

    fn close(
        &self,
        state: &mut FleetState,
        vehicle_id: &VehicleId,
        reason: CloseReason,
    ) -> Option<ClosedTrip> {
        let trip = state.trips.remove(vehicle_id)?;
        info!(
            trip_id = %trip.trip_id,
            vehicle_id = %vehicle_id,
            reason = %reason,
            reports = %trip.reports.len(),
            "trip_closed"
        );
        self.metrics.record_trip_closed(reason);
        Some(ClosedTrip { trip, reason })
    }

    /// Number of open trips
    pub fn fleet_size(&self) -> usize {
        self.fleet.lock().trips.len()
    }

    /// Trip id and block id of the vehicle's open trip, if any
    pub fn open_trip(&self, vehicle_id: &VehicleId) -> Option<(TripId, BlockId)> {
        self.fleet.lock().trips.get(vehicle_id).map(|t| (t.trip_id, t.block_id))
    }
}
