//! Ended-trip processing: correction, map matching, stop times
//!
//! The poller hands closed trips to a bounded pool of workers. Each trip is
//! saved, then (with matching enabled) corrected, matched and given stop
//! times, in its own task so a failure or panic stays with that trip.

use crate::domain::trip::{
    IgnoreReason, Trip, TripDisposition, PROBLEM_MATCH, PROBLEM_MULTIPLE_MATCHINGS,
};
use crate::infra::metrics::Metrics;
use crate::io::map_match::{MapMatcher, TracePoint};
use crate::io::route_catalog::SharedCatalog;
use crate::io::store::TripStore;
use crate::services::error_corrector;
use crate::services::interpolator::{build_waypoints, interpolate, measure_stops};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Matches below this confidence are reported but still used
pub const LOW_MATCH_CONFIDENCE: f64 = 0.5;

/// Runs one ended trip through the whole pipeline
pub struct TripFinalizer {
    store: Arc<dyn TripStore>,
    matcher: Arc<dyn MapMatcher>,
    catalog: SharedCatalog,
    metrics: Arc<Metrics>,
    matching_enabled: bool,
}

impl TripFinalizer {
    pub fn new(
        store: Arc<dyn TripStore>,
        matcher: Arc<dyn MapMatcher>,
        catalog: SharedCatalog,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { store, matcher, catalog, metrics, matching_enabled: true }
    }

    /// Only store ended trips when disabled
    pub fn with_matching(mut self, enabled: bool) -> Self {
        self.matching_enabled = enabled;
        self
    }

    /// Finalize with an entropy-seeded tie-break source
    pub async fn finalize(&self, trip: Trip) -> anyhow::Result<TripDisposition> {
        // ThreadRng is not Send
        self.finalize_with_rng(trip, &mut StdRng::from_entropy()).await
    }

    /// Same as `finalize` with a caller-supplied tie-break source
    pub async fn finalize_with_rng<R: Rng + ?Sized>(
        &self,
        mut trip: Trip,
        rng: &mut R,
    ) -> anyhow::Result<TripDisposition> {
        if !self.save(&trip).await? {
            return Ok(TripDisposition::Saved);
        }
        let corrected = error_corrector::correct(&mut trip, rng);
        self.process(trip, corrected).await
    }

    /// Store the trip as observed; returns whether processing continues
    async fn save(&self, trip: &Trip) -> anyhow::Result<bool> {
        self.store.save_trip(&trip.to_record()).await?;
        self.metrics.record_trip_saved();
        debug!(
            trip_id = %trip.trip_id,
            block_id = %trip.block_id,
            reports = %trip.reports.len(),
            "trip_saved"
        );
        Ok(self.matching_enabled)
    }

    async fn process(
        &self,
        mut trip: Trip,
        corrected: Result<(), IgnoreReason>,
    ) -> anyhow::Result<TripDisposition> {
        let ignored: Vec<u32> = trip.ignored_reports.iter().map(|r| r.sequence).collect();
        self.store.ignore_reports(trip.trip_id, &ignored).await?;

        if let Err(reason) = corrected {
            return self.ignore(&trip, reason).await;
        }

        let points: Vec<TracePoint> = trip
            .reports
            .iter()
            .map(|r| TracePoint { longitude: r.longitude, latitude: r.latitude, time: r.timestamp })
            .collect();
        let started = Instant::now();
        let response = self.matcher.match_trace(&points).await;
        self.metrics.record_match_latency(started.elapsed().as_millis() as u64);

        let response = match response {
            Ok(response) if response.code == "Ok" => response,
            Ok(response) => {
                warn!(trip_id = %trip.trip_id, code = %response.code, "match_rejected");
                return self.flag(&mut trip, PROBLEM_MATCH).await;
            }
            Err(e) => {
                warn!(trip_id = %trip.trip_id, error = %e, "match_request_failed");
                return self.flag(&mut trip, PROBLEM_MATCH).await;
            }
        };
        if response.matchings.len() != 1 {
            debug!(trip_id = %trip.trip_id, matchings = %response.matchings.len(), "match_ambiguous");
            return self.flag(&mut trip, PROBLEM_MULTIPLE_MATCHINGS).await;
        }
        let Some(matching) = response.matchings.into_iter().next() else {
            return self.flag(&mut trip, PROBLEM_MULTIPLE_MATCHINGS).await;
        };

        let geometry = matching.geometry.coordinates;
        self.store.store_match(trip.trip_id, matching.confidence, &geometry).await?;
        trip.match_confidence = Some(matching.confidence);
        if matching.confidence < LOW_MATCH_CONFIDENCE {
            info!(trip_id = %trip.trip_id, confidence = %matching.confidence, "match_confidence_low");
        }

        trip.waypoints = build_waypoints(&geometry, &response.tracepoints, &trip.reports);
        let stops = self.catalog.read().stops_for(&trip.route_id, &trip.direction_id).to_vec();
        trip.stops = measure_stops(&geometry, &stops);
        trip.match_geometry = Some(geometry);

        let result = interpolate(&trip.waypoints, &trip.stops);
        for stop_time in &result.stop_times {
            self.store.store_stop_time(trip.trip_id, &stop_time.stop_id, stop_time.time).await?;
        }

        if !result.is_complete() {
            return self.ignore(&trip, IgnoreReason::OneStopTime).await;
        }

        self.store.finish_trip(trip.trip_id).await?;
        let stop_times = result.stop_times.len();
        self.metrics.record_trip_finished(stop_times);
        info!(
            trip_id = %trip.trip_id,
            route_id = %trip.route_id,
            confidence = %matching.confidence,
            waypoints = %trip.waypoints.len(),
            stop_times = %stop_times,
            "trip_finished"
        );
        Ok(TripDisposition::Finished { stop_times })
    }

    async fn ignore(&self, trip: &Trip, reason: IgnoreReason) -> anyhow::Result<TripDisposition> {
        self.store.ignore_trip(trip.trip_id, reason).await?;
        self.metrics.record_trip_ignored();
        info!(
            trip_id = %trip.trip_id,
            reason = %reason,
            reports = %trip.reports.len(),
            ignored_reports = %trip.ignored_reports.len(),
            "trip_ignored"
        );
        Ok(TripDisposition::Ignored(reason))
    }

    async fn flag(&self, trip: &mut Trip, problem: &str) -> anyhow::Result<TripDisposition> {
        trip.flag(problem);
        self.store.flag_trip(trip.trip_id, problem).await?;
        self.metrics.record_trip_flagged();
        info!(trip_id = %trip.trip_id, problem = %problem, "trip_flagged");
        Ok(TripDisposition::Flagged(problem.to_string()))
    }
}

/// Bounded pool of finalizer workers fed through a queue
pub struct FinalizerPool {
    tx: mpsc::Sender<Trip>,
    workers: Vec<JoinHandle<()>>,
    metrics: Arc<Metrics>,
}

impl FinalizerPool {
    /// Start `workers` workers sharing a queue of `queue_size` trips
    pub fn spawn(
        finalizer: Arc<TripFinalizer>,
        workers: usize,
        queue_size: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Trip>(queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let finalizer = finalizer.clone();
                let metrics = metrics.clone();
                tokio::spawn(run_worker(worker, rx, finalizer, metrics))
            })
            .collect();

        info!(queue_size = %queue_size, "finalizer_pool_started");
        Self { tx, workers, metrics }
    }

    /// Queue an ended trip, waiting while the queue is full
    pub async fn submit(&self, trip: Trip) -> anyhow::Result<()> {
        self.tx
            .send(trip)
            .await
            .map_err(|e| anyhow::anyhow!("finalizer queue closed, trip {} lost", e.0.trip_id))?;
        self.metrics.set_finalizer_queue_depth(self.queue_depth());
        Ok(())
    }

    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Stop accepting trips and wait for queued ones to finish
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "finalizer_worker_join_failed");
            }
        }
        info!("finalizer_pool_stopped");
    }
}

async fn run_worker(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<Trip>>>,
    finalizer: Arc<TripFinalizer>,
    metrics: Arc<Metrics>,
) {
    debug!(worker = %worker, "finalizer_worker_started");

    loop {
        let trip = { rx.lock().await.recv().await };
        let Some(trip) = trip else {
            break;
        };
        let trip_id = trip.trip_id;

        // A task per trip keeps a panic from taking the worker down
        let finalizer = finalizer.clone();
        match tokio::spawn(async move { finalizer.finalize(trip).await }).await {
            Ok(Ok(disposition)) => {
                debug!(trip_id = %trip_id, disposition = %disposition.as_str(), "trip_finalized");
            }
            Ok(Err(e)) => {
                metrics.record_finalizer_failure();
                error!(trip_id = %trip_id, error = %e, "trip_finalize_failed");
            }
            Err(e) => {
                metrics.record_finalizer_failure();
                error!(trip_id = %trip_id, error = %e, "trip_finalize_panicked");
            }
        }
    }

    debug!(worker = %worker, "finalizer_worker_stopped");
}
