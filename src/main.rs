//! Transit trips - reconstructs vehicle trips from a GTFS-realtime feed
//!
//! Polls vehicle positions, splits them into trips, cleans and map-matches
//! ended trips and estimates stop arrival times.
//!
//! Module structure:
//! - `domain/` - Core business types (Trip, reports, geometry)
//! - `io/` - External interfaces (feed, GTFS, OSRM, store, Prometheus)
//! - `services/` - Business logic (Poller, FleetTracker, TripFinalizer)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use transit_trips::domain::{Trip, TripId};
use transit_trips::infra::{Config, Metrics};
use transit_trips::io::{
    GtfsRtJsonFeed, JsonlTripStore, OsrmClient, RouteCatalog, SequenceAllocator, TripStore,
};
use transit_trips::services::{FinalizerPool, FleetTracker, Poller, TripFinalizer};

/// Transit trips - vehicle trip reconstruction from realtime positions
#[derive(Parser, Debug)]
#[command(name = "transit-trips", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Only store ended trips, skip correction and matching
    #[arg(long, conflicts_with = "matching")]
    no_matching: bool,

    /// Force map matching on regardless of the config file
    #[arg(long)]
    matching: bool,

    /// Run one stored trip through the finalizer again and exit
    #[arg(long, value_name = "TRIP_ID")]
    reprocess_trip: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-report visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!("transit-trips starting");

    let args = Args::parse();

    let mut config = Config::load_from_path(&args.config);
    if args.no_matching {
        config = config.with_matching_enabled(false);
    } else if args.matching {
        config = config.with_matching_enabled(true);
    }

    info!(
        config_file = %config.config_file(),
        feed_url = %config.feed_url(),
        agency = %config.agency(),
        feed_mode = ?config.feed_mode(),
        poll_interval_secs = %config.poll_interval_secs(),
        fleet_timeout_secs = %config.fleet_timeout_secs(),
        trip_identity = ?config.trip_identity(),
        gtfs_dir = %config.gtfs_dir(),
        matching_enabled = %config.matching_enabled(),
        matching_url = %config.matching_url(),
        finalizer_workers = %config.finalizer_workers(),
        store_dir = %config.store_dir(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let catalog = RouteCatalog::load_dir(config.gtfs_dir())
        .with_context(|| format!("loading GTFS from {}", config.gtfs_dir()))?;
    info!(trips = %catalog.trip_count(), "route_catalog_loaded");
    let catalog = Arc::new(RwLock::new(catalog));

    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(JsonlTripStore::open(config.store_dir())?);
    let matcher = Arc::new(OsrmClient::new(
        config.matching_url(),
        config.matching_profile(),
        config.matching_radius_m(),
        Duration::from_millis(config.matching_timeout_ms()),
    )?);
    let finalizer = Arc::new(
        TripFinalizer::new(store.clone(), matcher, catalog.clone(), metrics.clone())
            .with_matching(config.matching_enabled()),
    );

    if let Some(id) = args.reprocess_trip {
        let record = store
            .load_trip(TripId(id))
            .await?
            .with_context(|| format!("trip {id} not found in {}", config.store_dir()))?;
        let disposition = finalizer.finalize(Trip::load(record)).await?;
        info!(trip_id = %id, disposition = %disposition.as_str(), "trip_reprocessed");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let agency = config.agency().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = transit_trips::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                agency,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    let ids = Arc::new(SequenceAllocator::open(config.store_dir())?);
    let tracker = Arc::new(FleetTracker::new(
        config.fleet_timeout_secs(),
        config.trip_identity(),
        catalog.clone(),
        ids,
        metrics.clone(),
    ));
    let pool = FinalizerPool::spawn(
        finalizer,
        config.finalizer_workers(),
        config.finalizer_queue_size(),
        metrics.clone(),
    );
    let feed = Arc::new(GtfsRtJsonFeed::new(
        config.feed_url(),
        config.agency(),
        Duration::from_millis(config.request_timeout_ms()),
    )?);

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let poller = Poller::new(config, feed, tracker, pool, catalog, metrics.clone());
    info!("poller_started");
    poller.run(shutdown_rx).await;

    metrics.report().log();
    info!("transit-trips shutdown complete");
    Ok(())
}
