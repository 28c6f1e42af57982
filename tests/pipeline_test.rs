//! End-to-end test: replayed feed -> fleet tracker -> finalizer -> JSONL store

use async_trait::async_trait;
use parking_lot::RwLock;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use transit_trips::domain::{FeedSnapshot, RawPositionReport, TripId, VehicleId};
use transit_trips::infra::{Config, Metrics};
use transit_trips::io::map_match::{LineGeometry, Matching, Tracepoint};
use transit_trips::io::{
    FeedError, FeedSource, JsonlTripStore, MapMatcher, MatchError, MatchResponse, RouteCatalog,
    SequenceAllocator, TracePoint, TripStore,
};
use transit_trips::services::{FinalizerPool, FleetTracker, Poller, TripFinalizer};

const REPLAY_START: u64 = 1_709_294_400;
const STEP_DEG: f64 = 0.006;

/// One bus driving east along the equator, parked after five minutes
struct EastboundFeed;

#[async_trait]
impl FeedSource for EastboundFeed {
    async fn fetch(&self, at: Option<u64>) -> Result<FeedSnapshot, FeedError> {
        let at = at.ok_or_else(|| FeedError::Status("live fetch in replay test".to_string()))?;
        let step = (at - REPLAY_START) / 60;
        let report = RawPositionReport {
            vehicle_id: VehicleId::new("4012"),
            operating: step < 5,
            route_id: None,
            direction_id: None,
            trip_id: Some("T100".to_string()),
            longitude: step as f64 * STEP_DEG,
            latitude: 0.0,
            observed_at: at as f64,
        };
        Ok(FeedSnapshot { feed_timestamp: at, server_time: at as f64, reports: vec![report] })
    }
}

/// Snaps every point to itself
struct EchoMatcher;

#[async_trait]
impl MapMatcher for EchoMatcher {
    async fn match_trace(&self, points: &[TracePoint]) -> Result<MatchResponse, MatchError> {
        let coordinates: Vec<[f64; 2]> = points.iter().map(|p| [p.longitude, p.latitude]).collect();
        Ok(MatchResponse {
            code: "Ok".to_string(),
            matchings: vec![Matching { confidence: 0.9, geometry: LineGeometry { coordinates: coordinates.clone() } }],
            tracepoints: coordinates.into_iter().map(|location| Some(Tracepoint { location })).collect(),
        })
    }
}

fn write_gtfs(dir: &Path) {
    fs::write(dir.join("trips.txt"), "route_id,service_id,trip_id,direction_id\n504,WK,T100,0\n").unwrap();
    fs::write(
        dir.join("stops.txt"),
        format!(
            "stop_id,stop_name,stop_lat,stop_lon\nA,First,0.0,{}\nB,Second,0.0,{}\nC,Third,0.0,{}\n",
            STEP_DEG * 0.5,
            STEP_DEG * 2.5,
            STEP_DEG * 3.5
        ),
    )
    .unwrap();
    fs::write(
        dir.join("stop_times.txt"),
        "trip_id,arrival_time,departure_time,stop_id,stop_sequence\n\
         T100,08:00:00,08:00:00,A,1\n\
         T100,08:03:00,08:03:00,B,2\n\
         T100,08:05:00,08:05:00,C,3\n",
    )
    .unwrap();
}

fn write_config(dir: &Path) -> Config {
    let path = dir.join("replay.toml");
    fs::write(
        &path,
        format!(
            r#"
[feed]
url = "http://localhost:8080"
agency = "ttc"
mode = "replay"

[feed.replay]
start = "2024-03-01T12:00:00Z"
end = "2024-03-01T12:06:00Z"
increment_secs = 60

[gtfs]
dir = "{gtfs}"

[matching]
enabled = true

[finalizer]
workers = 2
queue_size = 4

[store]
dir = "{store}"
"#,
            gtfs = dir.display(),
            store = dir.join("store").display()
        ),
    )
    .unwrap();
    Config::from_file(&path).unwrap()
}

#[tokio::test]
async fn test_replayed_trip_is_finished_and_stored() {
    let dir = tempfile::tempdir().unwrap();
    write_gtfs(dir.path());
    let config = write_config(dir.path());

    let catalog = Arc::new(RwLock::new(RouteCatalog::load_dir(config.gtfs_dir()).unwrap()));
    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(JsonlTripStore::open(config.store_dir()).unwrap());
    let ids = Arc::new(SequenceAllocator::open(config.store_dir()).unwrap());

    let tracker = Arc::new(FleetTracker::new(
        config.fleet_timeout_secs(),
        config.trip_identity(),
        catalog.clone(),
        ids,
        metrics.clone(),
    ));
    let finalizer = Arc::new(
        TripFinalizer::new(store.clone(), Arc::new(EchoMatcher), catalog.clone(), metrics.clone())
            .with_matching(config.matching_enabled()),
    );
    let pool = FinalizerPool::spawn(
        finalizer,
        config.finalizer_workers(),
        config.finalizer_queue_size(),
        metrics.clone(),
    );
    let store_dir = config.store_dir().to_string();
    let poller = Poller::new(config, Arc::new(EastboundFeed), tracker, pool, catalog, metrics.clone());

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    poller.run(shutdown_rx).await;

    let events: Vec<serde_json::Value> = fs::read_to_string(Path::new(&store_dir).join("trips.jsonl"))
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let kinds: Vec<&str> = events.iter().map(|e| e["event"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["saved", "matched", "stop_time", "stop_time", "stop_time", "finished"]);

    let stop_times: Vec<(String, f64)> = events
        .iter()
        .filter(|e| e["event"] == "stop_time")
        .map(|e| (e["stop_id"].as_str().unwrap().to_string(), e["time"].as_f64().unwrap()))
        .collect();
    let start = REPLAY_START as f64;
    for ((stop_id, time), (expected_id, offset)) in
        stop_times.iter().zip([("A", 30.0), ("B", 150.0), ("C", 210.0)])
    {
        assert_eq!(stop_id, expected_id);
        assert!((time - (start + offset)).abs() < 0.5, "{stop_id} at {time}");
    }

    let trip_id = TripId(events[0]["trip"]["trip_id"].as_u64().unwrap());
    let record = store.load_trip(trip_id).await.unwrap().unwrap();
    assert_eq!(record.route_id, "504");
    assert_eq!(record.reports.len(), 5);

    let summary = metrics.report();
    assert_eq!(summary.trips_opened, 1);
    assert_eq!(summary.cycles_total, 7);
}
