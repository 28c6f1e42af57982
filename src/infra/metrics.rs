//! Lock-free metrics collection and periodic reporting
//!
//! Counters are plain atomics bumped from the poller and finalizer tasks.
//! `report()` swaps the window counters out; `snapshot()` only reads them.
//!
//! NOTE: Relaxed ordering throughout. These are statistical counters only,
//! never use them for coordination.

use crate::domain::types::CloseReason;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Match request latency bucket boundaries (milliseconds)
/// Buckets: ≤25, ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, >12800
pub const MATCH_LATENCY_BOUNDS: [u64; 10] = [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800];
pub const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    MATCH_LATENCY_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    // Last bucket reports 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps the windowed values to get a consistent snapshot.
pub struct Metrics {
    /// Polling cycles that reached the fleet tracker (monotonic)
    cycles_total: AtomicU64,
    /// Cycles skipped because the feed timestamp had not advanced (monotonic)
    cycles_duplicate: AtomicU64,
    /// Cycles abandoned on feed/transport failure (monotonic)
    feed_errors: AtomicU64,
    /// Reports appended to a trip (monotonic)
    reports_ingested: AtomicU64,
    /// Reports dropped because their trip/route could not be resolved (monotonic)
    reports_unresolved: AtomicU64,
    /// Reports dropped because they were not newer than the trip's latest (monotonic)
    reports_stale: AtomicU64,
    trips_opened: AtomicU64,
    trips_closed_not_seen: AtomicU64,
    trips_closed_changed_trip: AtomicU64,
    /// Ended trips persisted (more than one report)
    trips_saved: AtomicU64,
    trips_ignored: AtomicU64,
    trips_flagged: AtomicU64,
    trips_finished: AtomicU64,
    stop_times_total: AtomicU64,
    /// Finalizer tasks that panicked or failed unexpectedly
    finalizer_failures: AtomicU64,
    /// Open trips after the latest cycle
    fleet_size: AtomicU64,
    /// Trips waiting for a finalizer worker
    finalizer_queue_depth: AtomicU64,
    /// Match requests since last report (reset on report)
    match_requests_since_report: AtomicU64,
    match_latency_buckets: [AtomicU64; NUM_BUCKETS],
    match_latency_sum_ms: AtomicU64,
    match_latency_max_ms: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            cycles_total: AtomicU64::new(0),
            cycles_duplicate: AtomicU64::new(0),
            feed_errors: AtomicU64::new(0),
            reports_ingested: AtomicU64::new(0),
            reports_unresolved: AtomicU64::new(0),
            reports_stale: AtomicU64::new(0),
            trips_opened: AtomicU64::new(0),
            trips_closed_not_seen: AtomicU64::new(0),
            trips_closed_changed_trip: AtomicU64::new(0),
            trips_saved: AtomicU64::new(0),
            trips_ignored: AtomicU64::new(0),
            trips_flagged: AtomicU64::new(0),
            trips_finished: AtomicU64::new(0),
            stop_times_total: AtomicU64::new(0),
            finalizer_failures: AtomicU64::new(0),
            fleet_size: AtomicU64::new(0),
            finalizer_queue_depth: AtomicU64::new(0),
            match_requests_since_report: AtomicU64::new(0),
            match_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            match_latency_sum_ms: AtomicU64::new(0),
            match_latency_max_ms: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_cycle(&self) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_duplicate_cycle(&self) {
        self.cycles_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_feed_error(&self) {
        self.feed_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_report_ingested(&self) {
        self.reports_ingested.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_report_unresolved(&self) {
        self.reports_unresolved.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_report_stale(&self) {
        self.reports_stale.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_trip_opened(&self) {
        self.trips_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_trip_closed(&self, reason: CloseReason) {
        match reason {
            CloseReason::NotSeen => self.trips_closed_not_seen.fetch_add(1, Ordering::Relaxed),
            CloseReason::ChangedTrip => {
                self.trips_closed_changed_trip.fetch_add(1, Ordering::Relaxed)
            }
        };
    }

    #[inline]
    pub fn record_trip_saved(&self) {
        self.trips_saved.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_trip_ignored(&self) {
        self.trips_ignored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_trip_flagged(&self) {
        self.trips_flagged.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_trip_finished(&self, stop_times: usize) {
        self.trips_finished.fetch_add(1, Ordering::Relaxed);
        self.stop_times_total.fetch_add(stop_times as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_finalizer_failure(&self) {
        self.finalizer_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_fleet_size(&self, size: usize) {
        self.fleet_size.store(size as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_finalizer_queue_depth(&self, depth: usize) {
        self.finalizer_queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    /// Record a map-match round trip (lock-free)
    #[inline]
    pub fn record_match_latency(&self, latency_ms: u64) {
        self.match_requests_since_report.fetch_add(1, Ordering::Relaxed);
        self.match_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.match_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.match_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn fleet_size(&self) -> u64 {
        self.fleet_size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn finalizer_failures(&self) -> u64 {
        self.finalizer_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn trips_finished(&self) -> u64 {
        self.trips_finished.load(Ordering::Relaxed)
    }

    /// Generate a summary and reset the windowed match-latency values
    pub fn report(&self) -> MetricsSummary {
        self.summarize(true)
    }

    /// Summary of the current window without resetting it (scrape endpoint)
    pub fn snapshot(&self) -> MetricsSummary {
        self.summarize(false)
    }

    fn summarize(&self, reset: bool) -> MetricsSummary {
        let now = Instant::now();
        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = now.duration_since(*last).as_secs_f64();
            if reset {
                *last = now;
            }
            elapsed
        };

        let take = |atomic: &AtomicU64| {
            if reset {
                atomic.swap(0, Ordering::Relaxed)
            } else {
                atomic.load(Ordering::Relaxed)
            }
        };
        let match_requests = take(&self.match_requests_since_report);
        let match_sum = take(&self.match_latency_sum_ms);
        let match_max = take(&self.match_latency_max_ms);
        let match_buckets = if reset {
            swap_buckets(&self.match_latency_buckets)
        } else {
            let mut buckets = [0u64; NUM_BUCKETS];
            for (slot, bucket) in buckets.iter_mut().zip(&self.match_latency_buckets) {
                *slot = bucket.load(Ordering::Relaxed);
            }
            buckets
        };

        MetricsSummary {
            elapsed_secs,
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            cycles_duplicate: self.cycles_duplicate.load(Ordering::Relaxed),
            feed_errors: self.feed_errors.load(Ordering::Relaxed),
            reports_ingested: self.reports_ingested.load(Ordering::Relaxed),
            reports_unresolved: self.reports_unresolved.load(Ordering::Relaxed),
            reports_stale: self.reports_stale.load(Ordering::Relaxed),
            trips_opened: self.trips_opened.load(Ordering::Relaxed),
            trips_closed_not_seen: self.trips_closed_not_seen.load(Ordering::Relaxed),
            trips_closed_changed_trip: self.trips_closed_changed_trip.load(Ordering::Relaxed),
            trips_saved: self.trips_saved.load(Ordering::Relaxed),
            trips_ignored: self.trips_ignored.load(Ordering::Relaxed),
            trips_flagged: self.trips_flagged.load(Ordering::Relaxed),
            trips_finished: self.trips_finished.load(Ordering::Relaxed),
            stop_times_total: self.stop_times_total.load(Ordering::Relaxed),
            finalizer_failures: self.finalizer_failures.load(Ordering::Relaxed),
            fleet_size: self.fleet_size.load(Ordering::Relaxed),
            finalizer_queue_depth: self.finalizer_queue_depth.load(Ordering::Relaxed),
            match_requests,
            match_avg_ms: if match_requests > 0 { match_sum / match_requests } else { 0 },
            match_max_ms: match_max,
            match_p50_ms: percentile_from_buckets(&match_buckets, 0.50),
            match_p95_ms: percentile_from_buckets(&match_buckets, 0.95),
            match_buckets,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the metrics
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub elapsed_secs: f64,
    pub cycles_total: u64,
    pub cycles_duplicate: u64,
    pub feed_errors: u64,
    pub reports_ingested: u64,
    pub reports_unresolved: u64,
    pub reports_stale: u64,
    pub trips_opened: u64,
    pub trips_closed_not_seen: u64,
    pub trips_closed_changed_trip: u64,
    pub trips_saved: u64,
    pub trips_ignored: u64,
    pub trips_flagged: u64,
    pub trips_finished: u64,
    pub stop_times_total: u64,
    pub finalizer_failures: u64,
    pub fleet_size: u64,
    pub finalizer_queue_depth: u64,
    pub match_requests: u64,
    pub match_avg_ms: u64,
    pub match_max_ms: u64,
    pub match_p50_ms: u64,
    pub match_p95_ms: u64,
    pub match_buckets: [u64; NUM_BUCKETS],
}

impl MetricsSummary {
    /// Log the summary as a single structured event
    pub fn log(&self) {
        info!(
            fleet_size = %self.fleet_size,
            cycles = %self.cycles_total,
            duplicate_cycles = %self.cycles_duplicate,
            feed_errors = %self.feed_errors,
            reports = %self.reports_ingested,
            unresolved = %self.reports_unresolved,
            stale = %self.reports_stale,
            opened = %self.trips_opened,
            closed_not_seen = %self.trips_closed_not_seen,
            closed_changed_trip = %self.trips_closed_changed_trip,
            saved = %self.trips_saved,
            ignored = %self.trips_ignored,
            flagged = %self.trips_flagged,
            finished = %self.trips_finished,
            stop_times = %self.stop_times_total,
            finalizer_failures = %self.finalizer_failures,
            queue_depth = %self.finalizer_queue_depth,
            match_requests = %self.match_requests,
            match_avg_ms = %self.match_avg_ms,
            match_p95_ms = %self.match_p95_ms,
            match_max_ms = %self.match_max_ms,
            "metrics"
        );
    }
}
