//! Tests for the FleetTracker module

use super::*;
use crate::domain::types::TripId;
use crate::io::store::MemoryTripStore;
use parking_lot::RwLock;

struct TestFleet {
    tracker: FleetTracker,
    ids: Arc<MemoryTripStore>,
    metrics: Arc<Metrics>,
}

impl std::ops::Deref for TestFleet {
    type Target = FleetTracker;
    fn deref(&self) -> &Self::Target {
        &self.tracker
    }
}

fn create_test_fleet() -> TestFleet {
    create_test_fleet_with(180, TripIdentity::Trip)
}

fn create_test_fleet_with(timeout_secs: u64, identity: TripIdentity) -> TestFleet {
    let mut catalog = RouteCatalog::default();
    catalog.insert_trip("T1", "R1", "0");
    catalog.insert_trip("T1b", "R1", "0");
    catalog.insert_trip("T2", "R2", "0");
    let catalog = Arc::new(RwLock::new(catalog));

    let ids = Arc::new(MemoryTripStore::new());
    let metrics = Arc::new(Metrics::new());
    let tracker = FleetTracker::new(timeout_secs, identity, catalog, ids.clone(), metrics.clone());
    TestFleet { tracker, ids, metrics }
}

/// Builder for creating test RawPositionReport instances
struct ReportBuilder {
    report: RawPositionReport,
}

impl ReportBuilder {
    fn new(vehicle: &str, trip: &str, t: f64) -> Self {
        Self {
            report: RawPositionReport {
                vehicle_id: VehicleId::new(vehicle),
                operating: true,
                route_id: None,
                direction_id: None,
                trip_id: Some(trip.to_string()),
                longitude: -79.4,
                latitude: 43.6 + t * 0.0001,
                observed_at: t,
            },
        }
    }

    fn route_only(mut self, route_id: &str, direction_id: &str) -> Self {
        self.report.trip_id = None;
        self.report.route_id = Some(route_id.to_string());
        self.report.direction_id = Some(direction_id.to_string());
        self
    }

    fn not_operating(mut self) -> Self {
        self.report.operating = false;
        self
    }

    fn build(self) -> RawPositionReport {
        self.report
    }
}

fn report(vehicle: &str, trip: &str, t: f64) -> RawPositionReport {
    ReportBuilder::new(vehicle, trip, t).build()
}

fn snapshot(server_time: f64, reports: Vec<RawPositionReport>) -> FeedSnapshot {
    FeedSnapshot { feed_timestamp: server_time as u64, server_time, reports }
}

fn open_reports(fleet: &TestFleet, vehicle: &str) -> usize {
    fleet.tracker.fleet.lock().trips.get(&VehicleId::new(vehicle)).map_or(0, |t| t.reports.len())
}

#[test]
fn test_first_sighting_opens_trip() {
    let fleet = create_test_fleet();

    let closed = fleet.ingest(&snapshot(0.0, vec![report("V1", "T1", 0.0)]));

    assert!(closed.is_empty());
    assert_eq!(fleet.fleet_size(), 1);
    assert_eq!(fleet.open_trip(&VehicleId::new("V1")), Some((TripId(1), BlockId(1))));
    assert_eq!(fleet.metrics.report().trips_opened, 1);
}

#[test]
fn test_reports_append_to_open_trip() {
    let fleet = create_test_fleet();

    for t in [0.0, 10.0, 20.0] {
        fleet.ingest(&snapshot(t, vec![report("V1", "T1", t)]));
    }

    assert_eq!(fleet.fleet_size(), 1);
    assert_eq!(open_reports(&fleet, "V1"), 3);
    let state = fleet.tracker.fleet.lock();
    let trip = &state.trips[&VehicleId::new("V1")];
    assert_eq!(trip.last_seen, 20.0);
    assert_eq!(trip.sequence, 3);
}

#[test]
fn test_duplicate_feed_timestamp_is_noop() {
    let fleet = create_test_fleet();

    fleet.ingest(&snapshot(10.0, vec![report("V1", "T1", 10.0)]));
    let again = FeedSnapshot {
        feed_timestamp: 10,
        server_time: 15.0,
        reports: vec![report("V1", "T1", 15.0), report("V2", "T2", 15.0)],
    };
    let closed = fleet.ingest(&again);

    assert!(closed.is_empty());
    assert_eq!(fleet.fleet_size(), 1);
    assert_eq!(open_reports(&fleet, "V1"), 1);
    let summary = fleet.metrics.report();
    assert_eq!(summary.cycles_total, 1);
    assert_eq!(summary.cycles_duplicate, 1);
}

#[test]
fn test_timeout_closes_exactly_once() {
    let fleet = create_test_fleet();

    fleet.ingest(&snapshot(100.0, vec![report("V1", "T1", 100.0)]));
    assert!(fleet.ingest(&snapshot(280.0, vec![])).is_empty());

    let closed = fleet.ingest(&snapshot(300.0, vec![]));
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].reason, CloseReason::NotSeen);
    assert_eq!(closed[0].trip.vehicle_id, VehicleId::new("V1"));
    assert_eq!(fleet.fleet_size(), 0);

    assert!(fleet.ingest(&snapshot(400.0, vec![])).is_empty());
}

#[test]
fn test_present_but_stale_vehicle_times_out() {
    let fleet = create_test_fleet();

    fleet.ingest(&snapshot(100.0, vec![report("V1", "T1", 100.0)]));
    // Feed keeps echoing the same observation
    fleet.ingest(&snapshot(200.0, vec![report("V1", "T1", 100.0)]));
    assert_eq!(open_reports(&fleet, "V1"), 1);

    let closed = fleet.ingest(&snapshot(300.0, vec![report("V1", "T1", 100.0)]));
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].reason, CloseReason::NotSeen);
    assert_eq!(fleet.fleet_size(), 0);
    assert_eq!(fleet.metrics.report().reports_stale, 2);
}

#[test]
fn test_identity_change_splits_trip_in_same_block() {
    let fleet = create_test_fleet();

    for t in [0.0, 10.0, 20.0, 30.0, 40.0, 50.0] {
        fleet.ingest(&snapshot(t, vec![report("V1", "T1", t)]));
    }
    let closed = fleet.ingest(&snapshot(60.0, vec![report("V1", "T2", 60.0)]));

    assert_eq!(closed.len(), 1);
    let first = &closed[0].trip;
    assert_eq!(closed[0].reason, CloseReason::ChangedTrip);
    assert_eq!(first.route_id, "R1");
    assert_eq!(first.reports.len(), 6);

    let state = fleet.tracker.fleet.lock();
    let second = &state.trips[&VehicleId::new("V1")];
    assert_eq!(second.route_id, "R2");
    assert_eq!(second.block_id, first.block_id);
    assert_ne!(second.trip_id, first.trip_id);
    assert_eq!(second.reports.len(), 1);
    assert!(first.reports.last().unwrap().timestamp < second.reports[0].timestamp);
}

#[test]
fn test_route_direction_identity_ignores_trip_id_change() {
    let fleet = create_test_fleet_with(180, TripIdentity::RouteDirection);

    fleet.ingest(&snapshot(0.0, vec![report("V1", "T1", 0.0)]));
    let closed = fleet.ingest(&snapshot(10.0, vec![report("V1", "T1b", 10.0)]));
    assert!(closed.is_empty());
    assert_eq!(open_reports(&fleet, "V1"), 2);

    let closed = fleet.ingest(&snapshot(20.0, vec![report("V1", "T2", 20.0)]));
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].reason, CloseReason::ChangedTrip);
}

#[test]
fn test_non_operating_closes_without_reopening() {
    let fleet = create_test_fleet();

    fleet.ingest(&snapshot(0.0, vec![report("V1", "T1", 0.0)]));
    let closed =
        fleet.ingest(&snapshot(10.0, vec![ReportBuilder::new("V1", "T1", 10.0).not_operating().build()]));

    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].reason, CloseReason::NotSeen);
    assert_eq!(fleet.fleet_size(), 0);

    // Non-operating vehicles never open a trip
    let closed =
        fleet.ingest(&snapshot(20.0, vec![ReportBuilder::new("V2", "T1", 20.0).not_operating().build()]));
    assert!(closed.is_empty());
    assert_eq!(fleet.fleet_size(), 0);
}

#[test]
fn test_unresolved_reports_are_dropped() {
    let fleet = create_test_fleet();

    fleet.ingest(&snapshot(0.0, vec![report("V1", "T9", 0.0), report("V2", "T2", 0.0)]));

    assert_eq!(fleet.fleet_size(), 1);
    assert!(fleet.open_trip(&VehicleId::new("V1")).is_none());
    assert_eq!(fleet.metrics.report().reports_unresolved, 1);
}

#[test]
fn test_one_open_trip_per_vehicle_within_a_snapshot() {
    let fleet = create_test_fleet();

    let closed = fleet.ingest(&snapshot(
        10.0,
        vec![report("V1", "T1", 5.0), report("V1", "T2", 10.0), report("V2", "T1", 10.0)],
    ));

    assert_eq!(closed.len(), 1);
    assert_eq!(fleet.fleet_size(), 2);
    let state = fleet.tracker.fleet.lock();
    assert_eq!(state.trips[&VehicleId::new("V1")].route_id, "R2");
}

#[test]
fn test_timed_out_vehicle_reappears_as_new_block() {
    let fleet = create_test_fleet();

    fleet.ingest(&snapshot(0.0, vec![report("V1", "T1", 0.0)]));
    let closed = fleet.ingest(&snapshot(500.0, vec![report("V1", "T1", 500.0)]));

    assert_eq!(closed.len(), 1);
    let (trip_id, block_id) = fleet.open_trip(&VehicleId::new("V1")).unwrap();
    assert_ne!(trip_id, closed[0].trip.trip_id);
    assert_ne!(block_id, closed[0].trip.block_id);
}

#[test]
fn test_id_allocation_failure_drops_report() {
    let fleet = create_test_fleet();
    fleet.ids.set_fail_allocation(true);

    fleet.ingest(&snapshot(0.0, vec![report("V1", "T1", 0.0)]));
    assert_eq!(fleet.fleet_size(), 0);

    fleet.ids.set_fail_allocation(false);
    fleet.ingest(&snapshot(10.0, vec![report("V1", "T1", 10.0)]));
    assert_eq!(fleet.fleet_size(), 1);
}

#[test]
fn test_route_change_without_trip_ids_splits_trip() {
    let fleet = create_test_fleet();

    fleet.ingest(&snapshot(0.0, vec![ReportBuilder::new("V1", "", 0.0).route_only("R1", "0").build()]));
    fleet.ingest(&snapshot(30.0, vec![ReportBuilder::new("V1", "", 30.0).route_only("R1", "0").build()]));
    assert_eq!(open_reports(&fleet, "V1"), 2);

    let closed =
        fleet.ingest(&snapshot(60.0, vec![ReportBuilder::new("V1", "", 60.0).route_only("R2", "0").build()]));

    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].reason, CloseReason::ChangedTrip);
    assert_eq!(closed[0].trip.route_id, "R1");
    let state = fleet.tracker.fleet.lock();
    let second = &state.trips[&VehicleId::new("V1")];
    assert_eq!(second.route_id, "R2");
    assert_eq!(second.block_id, closed[0].trip.block_id);
}

#[test]
fn test_identity_change_with_old_observation_is_stale() {
    let fleet = create_test_fleet();

    fleet.ingest(&snapshot(50.0, vec![report("V1", "T1", 50.0)]));
    let closed = fleet.ingest(&snapshot(60.0, vec![report("V1", "T2", 50.0)]));

    assert!(closed.is_empty());
    assert_eq!(fleet.metrics.report().reports_stale, 1);
    let state = fleet.tracker.fleet.lock();
    assert_eq!(state.trips[&VehicleId::new("V1")].route_id, "R1");
    drop(state);

    // A newer observation still splits, and strictly after the first trip
    let closed = fleet.ingest(&snapshot(70.0, vec![report("V1", "T2", 70.0)]));
    assert_eq!(closed.len(), 1);
    let first_last = closed[0].trip.reports.last().unwrap().timestamp;
    let state = fleet.tracker.fleet.lock();
    assert!(first_last < state.trips[&VehicleId::new("V1")].reports[0].timestamp);
}
