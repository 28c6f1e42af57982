//! Polling loop: feed -> fleet tracker -> finalizer pool
//!
//! Cycles run one after another on a single task. In live mode the loop
//! sleeps between polls; in replay mode it walks archived snapshots from the
//! configured start to end without sleeping.

use crate::domain::types::FeedSnapshot;
use crate::infra::config::{Config, FeedMode};
use crate::infra::metrics::Metrics;
use crate::io::feed::FeedSource;
use crate::io::route_catalog::{RouteCatalog, SharedCatalog};
use crate::services::finalizer::FinalizerPool;
use crate::services::fleet_tracker::FleetTracker;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Outcome of one polling cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleStatus {
    pub fleet_size: usize,
    pub ended: usize,
    /// Ended trips handed to the finalizer pool
    pub submitted: usize,
}

pub struct Poller {
    feed: Arc<dyn FeedSource>,
    tracker: Arc<FleetTracker>,
    pool: FinalizerPool,
    catalog: SharedCatalog,
    metrics: Arc<Metrics>,
    config: Config,
    cycles: u64,
}

impl Poller {
    pub fn new(
        config: Config,
        feed: Arc<dyn FeedSource>,
        tracker: Arc<FleetTracker>,
        pool: FinalizerPool,
        catalog: SharedCatalog,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { feed, tracker, pool, catalog, metrics, config, cycles: 0 }
    }

    /// Run until shutdown (live) or the end of the replay window, then drain
    /// the finalizer pool
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        match (self.config.feed_mode(), self.config.replay().cloned()) {
            (FeedMode::Replay, Some(replay)) => {
                let start = replay.start.timestamp().max(0) as u64;
                let end = replay.end.timestamp().max(0) as u64;
                let step = replay.increment_secs.max(1);
                info!(start = %replay.start, end = %replay.end, step_secs = %step, "replay_started");

                let mut at = start;
                while at <= end && !*shutdown.borrow() {
                    self.cycle(Some(at)).await;
                    at += step;
                }
                info!(cycles = %self.cycles, "replay_finished");
            }
            _ => {
                let interval = Duration::from_secs(self.config.poll_interval_secs());
                info!(interval_secs = %interval.as_secs(), "live_polling_started");

                loop {
                    self.cycle(None).await;
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!(cycles = %self.cycles, "poller_stopped");
        self.pool.shutdown().await;
    }

    /// One fetch-ingest-dispatch cycle. Feed failures abandon the cycle.
    pub async fn cycle(&mut self, at: Option<u64>) -> Option<CycleStatus> {
        let started = Instant::now();

        let snapshot = match self.feed.fetch(at).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.metrics.record_feed_error();
                warn!(at = ?at, error = %e, "feed_fetch_failed");
                return None;
            }
        };

        let status = self.apply(&snapshot).await;
        self.cycles += 1;
        self.maybe_refresh_catalog().await;

        info!(
            fleet_size = %status.fleet_size,
            ended = %status.ended,
            reports = %snapshot.reports.len(),
            cycle_time_ms = %started.elapsed().as_millis(),
            "cycle_complete"
        );
        Some(status)
    }

    /// Ingest a snapshot and hand every ended trip with more than one
    /// report to the finalizer pool
    pub async fn apply(&self, snapshot: &FeedSnapshot) -> CycleStatus {
        let ended = self.tracker.ingest(snapshot);
        let mut status =
            CycleStatus { fleet_size: self.tracker.fleet_size(), ended: ended.len(), submitted: 0 };

        for closed in ended {
            if closed.trip.reports.len() <= 1 {
                debug!(trip_id = %closed.trip.trip_id, reason = %closed.reason, "single_report_trip_dropped");
                continue;
            }
            match self.pool.submit(closed.trip).await {
                Ok(()) => status.submitted += 1,
                Err(e) => error!(error = %e, "trip_submit_failed"),
            }
        }
        status
    }

    async fn maybe_refresh_catalog(&self) {
        let every = self.config.refresh_every_cycles();
        if !self.config.refresh_routes() || every == 0 || self.cycles % every != 0 {
            return;
        }

        let dir = self.config.gtfs_dir().to_string();
        match tokio::task::spawn_blocking(move || RouteCatalog::load_dir(dir)).await {
            Ok(Ok(catalog)) => {
                *self.catalog.write() = catalog;
                info!(cycles = %self.cycles, "route_catalog_refreshed");
            }
            Ok(Err(e)) => warn!(error = %e, "route_catalog_refresh_failed"),
            Err(e) => warn!(error = %e, "route_catalog_refresh_failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{RawPositionReport, TripId, VehicleId};
    use crate::io::feed::FeedError;
    use crate::io::map_match::{MapMatcher, MatchError, MatchResponse, TracePoint};
    use crate::io::store::MemoryTripStore;
    use crate::services::finalizer::TripFinalizer;
    use async_trait::async_trait;
    use parking_lot::{Mutex, RwLock};
    use std::collections::VecDeque;

    /// Serves scripted snapshots in order; `None` entries fail
    struct ScriptedFeed {
        snapshots: Mutex<VecDeque<Option<FeedSnapshot>>>,
        requested: Mutex<Vec<Option<u64>>>,
    }

    #[async_trait]
    impl FeedSource for ScriptedFeed {
        async fn fetch(&self, at: Option<u64>) -> Result<FeedSnapshot, FeedError> {
            self.requested.lock().push(at);
            match self.snapshots.lock().pop_front().flatten() {
                Some(snapshot) => Ok(snapshot),
                None => Err(FeedError::Status("unavailable".to_string())),
            }
        }
    }

    struct RejectingMatcher;

    #[async_trait]
    impl MapMatcher for RejectingMatcher {
        async fn match_trace(&self, _points: &[TracePoint]) -> Result<MatchResponse, MatchError> {
            Ok(MatchResponse { code: "NoMatch".to_string(), matchings: Vec::new(), tracepoints: Vec::new() })
        }
    }

    fn report(vehicle: &str, trip: &str, t: f64, lon: f64) -> RawPositionReport {
        RawPositionReport {
            vehicle_id: VehicleId::new(vehicle),
            operating: true,
            route_id: None,
            direction_id: None,
            trip_id: Some(trip.to_string()),
            longitude: lon,
            latitude: 0.0,
            observed_at: t,
        }
    }

    fn snapshot(t: f64, reports: Vec<RawPositionReport>) -> FeedSnapshot {
        FeedSnapshot { feed_timestamp: t as u64, server_time: t, reports }
    }

    struct Harness {
        poller: Poller,
        feed: Arc<ScriptedFeed>,
        store: Arc<MemoryTripStore>,
        metrics: Arc<Metrics>,
    }

    fn harness(config: Config, snapshots: Vec<Option<FeedSnapshot>>) -> Harness {
        let mut catalog = RouteCatalog::default();
        catalog.insert_trip("T1", "R1", "0");
        catalog.insert_trip("T2", "R2", "0");
        let catalog = Arc::new(RwLock::new(catalog));

        let store = Arc::new(MemoryTripStore::new());
        let metrics = Arc::new(Metrics::new());
        let tracker = Arc::new(FleetTracker::new(
            config.fleet_timeout_secs(),
            config.trip_identity(),
            catalog.clone(),
            store.clone(),
            metrics.clone(),
        ));
        let finalizer = Arc::new(
            TripFinalizer::new(store.clone(), Arc::new(RejectingMatcher), catalog.clone(), metrics.clone())
                .with_matching(config.matching_enabled()),
        );
        let pool = FinalizerPool::spawn(finalizer, 2, 8, metrics.clone());
        let feed = Arc::new(ScriptedFeed {
            snapshots: Mutex::new(snapshots.into()),
            requested: Mutex::new(Vec::new()),
        });

        let poller = Poller::new(config, feed.clone(), tracker, pool, catalog, metrics.clone());
        Harness { poller, feed, store, metrics }
    }

    #[tokio::test]
    async fn test_feed_errors_do_not_stop_polling() {
        let mut h = harness(
            Config::default(),
            vec![None, Some(snapshot(10.0, vec![report("V1", "T1", 10.0, 0.0)]))],
        );

        assert!(h.poller.cycle(None).await.is_none());
        let status = h.poller.cycle(None).await.unwrap();

        assert_eq!(status.fleet_size, 1);
        assert_eq!(h.metrics.report().feed_errors, 1);
        assert_eq!(*h.feed.requested.lock(), vec![None, None]);
    }

    #[tokio::test]
    async fn test_changed_trip_is_submitted_and_flagged() {
        let snapshots = [0.0, 60.0, 120.0]
            .iter()
            .enumerate()
            .map(|(i, &t)| Some(snapshot(t, vec![report("V1", "T1", t, i as f64 * 0.006)])))
            .chain(std::iter::once(Some(snapshot(180.0, vec![report("V1", "T2", 180.0, 0.02)]))))
            .collect();
        let mut h = harness(Config::default().with_matching_enabled(true), snapshots);

        for _ in 0..3 {
            h.poller.cycle(None).await;
        }
        let status = h.poller.cycle(None).await.unwrap();
        assert_eq!(status.ended, 1);
        assert_eq!(status.submitted, 1);

        let Harness { poller, store, .. } = h;
        poller.pool.shutdown().await;

        let stored = store.trip(TripId(1)).unwrap();
        assert_eq!(stored.record.map(|r| r.reports.len()), Some(3));
        assert_eq!(stored.problems, vec!["match problem".to_string()]);
    }

    #[tokio::test]
    async fn test_single_report_trips_are_not_submitted() {
        let snapshots = vec![
            Some(snapshot(0.0, vec![report("V1", "T1", 0.0, 0.0)])),
            Some(snapshot(10.0, vec![report("V1", "T2", 10.0, 0.001)])),
        ];
        let mut h = harness(Config::default(), snapshots);

        h.poller.cycle(None).await;
        let status = h.poller.cycle(None).await.unwrap();

        assert_eq!(status.ended, 1);
        assert_eq!(status.submitted, 0);
        assert_eq!(h.store.trip_count(), 0);
    }

    #[tokio::test]
    async fn test_replay_walks_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.toml");
        std::fs::write(
            &path,
            r#"
[feed]
url = "http://localhost:8080"
agency = "ttc"
mode = "replay"

[feed.replay]
start = "2024-03-01T12:00:00Z"
end = "2024-03-01T12:01:00Z"
increment_secs = 20
"#,
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        let h = harness(config, Vec::new());
        let (_tx, rx) = watch::channel(false);

        let feed = h.feed.clone();
        h.poller.run(rx).await;

        let start = 1_709_294_400;
        assert_eq!(
            *feed.requested.lock(),
            vec![Some(start), Some(start + 20), Some(start + 40), Some(start + 60)]
        );
    }
}
