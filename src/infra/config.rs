//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// How the poller obtains snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
    /// Poll the current snapshot at a fixed interval
    #[default]
    Live,
    /// Walk archived snapshots between two timestamps
    Replay,
}

/// What makes a vehicle's next report belong to a different trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TripIdentity {
    /// The feed's trip identifier changed
    #[default]
    Trip,
    /// The route or direction changed
    RouteDirection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default = "default_replay_increment")]
    pub increment_secs: u64,
}

fn default_replay_increment() -> u64 {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    pub agency: String,
    #[serde(default)]
    pub mode: FeedMode,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub replay: Option<ReplayConfig>,
}

fn default_poll_interval() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    3000
}

#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    /// Seconds without a report before a trip is closed as "not seen"
    #[serde(default = "default_fleet_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub identity: TripIdentity,
}

fn default_fleet_timeout() -> u64 {
    180
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self { timeout_secs: default_fleet_timeout(), identity: TripIdentity::default() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GtfsConfig {
    /// Directory holding trips.txt, stops.txt and stop_times.txt
    #[serde(default = "default_gtfs_dir")]
    pub dir: String,
    /// Reload the route catalog periodically
    #[serde(default)]
    pub refresh_routes: bool,
    #[serde(default = "default_refresh_every_cycles")]
    pub refresh_every_cycles: u64,
}

fn default_gtfs_dir() -> String {
    "gtfs".to_string()
}

fn default_refresh_every_cycles() -> u64 {
    360
}

impl Default for GtfsConfig {
    fn default() -> Self {
        Self {
            dir: default_gtfs_dir(),
            refresh_routes: false,
            refresh_every_cycles: default_refresh_every_cycles(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchingConfig {
    /// Run finalization (correction, matching, interpolation) for ended trips
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_matching_url")]
    pub url: String,
    #[serde(default = "default_matching_profile")]
    pub profile: String,
    #[serde(default = "default_matching_timeout")]
    pub timeout_ms: u64,
    /// Search radius per tracepoint in metres
    #[serde(default = "default_matching_radius")]
    pub radius_m: f64,
}

fn default_matching_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_matching_profile() -> String {
    "driving".to_string()
}

fn default_matching_timeout() -> u64 {
    10_000
}

fn default_matching_radius() -> f64 {
    30.0
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_matching_url(),
            profile: default_matching_profile(),
            timeout_ms: default_matching_timeout(),
            radius_m: default_matching_radius(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinalizerConfig {
    #[serde(default = "default_finalizer_workers")]
    pub workers: usize,
    /// Ended trips queued before the poller waits for a free slot
    #[serde(default = "default_finalizer_queue")]
    pub queue_size: usize,
}

fn default_finalizer_workers() -> usize {
    4
}

fn default_finalizer_queue() -> usize {
    256
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self { workers: default_finalizer_workers(), queue_size: default_finalizer_queue() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Directory for trip records and id sequences
    #[serde(default = "default_store_dir")]
    pub dir: String,
}

fn default_store_dir() -> String {
    "data".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { dir: default_store_dir() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

fn default_metrics_interval() -> u64 {
    60
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: 0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    pub feed: FeedConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub gtfs: GtfsConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub finalizer: FinalizerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    config_file: String,
    feed_url: String,
    agency: String,
    feed_mode: FeedMode,
    poll_interval_secs: u64,
    request_timeout_ms: u64,
    replay: Option<ReplayConfig>,
    fleet_timeout_secs: u64,
    trip_identity: TripIdentity,
    gtfs_dir: String,
    refresh_routes: bool,
    refresh_every_cycles: u64,
    matching_enabled: bool,
    matching_url: String,
    matching_profile: String,
    matching_timeout_ms: u64,
    matching_radius_m: f64,
    finalizer_workers: usize,
    finalizer_queue_size: usize,
    store_dir: String,
    metrics_interval_secs: u64,
    prometheus_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_file: "default".to_string(),
            feed_url: "http://localhost:8080/".to_string(),
            agency: "ttc".to_string(),
            feed_mode: FeedMode::Live,
            poll_interval_secs: default_poll_interval(),
            request_timeout_ms: default_request_timeout(),
            replay: None,
            fleet_timeout_secs: default_fleet_timeout(),
            trip_identity: TripIdentity::Trip,
            gtfs_dir: default_gtfs_dir(),
            refresh_routes: false,
            refresh_every_cycles: default_refresh_every_cycles(),
            matching_enabled: false,
            matching_url: default_matching_url(),
            matching_profile: default_matching_profile(),
            matching_timeout_ms: default_matching_timeout(),
            matching_radius_m: default_matching_radius(),
            finalizer_workers: default_finalizer_workers(),
            finalizer_queue_size: default_finalizer_queue(),
            store_dir: default_store_dir(),
            metrics_interval_secs: default_metrics_interval(),
            prometheus_port: 0,
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        if toml_config.feed.mode == FeedMode::Replay && toml_config.feed.replay.is_none() {
            anyhow::bail!("feed.mode = \"replay\" requires a [feed.replay] section in {}", path.display());
        }

        Ok(Self {
            config_file: path.display().to_string(),
            feed_url: toml_config.feed.url,
            agency: toml_config.feed.agency,
            feed_mode: toml_config.feed.mode,
            poll_interval_secs: toml_config.feed.poll_interval_secs,
            request_timeout_ms: toml_config.feed.request_timeout_ms,
            replay: toml_config.feed.replay,
            fleet_timeout_secs: toml_config.fleet.timeout_secs,
            trip_identity: toml_config.fleet.identity,
            gtfs_dir: toml_config.gtfs.dir,
            refresh_routes: toml_config.gtfs.refresh_routes,
            refresh_every_cycles: toml_config.gtfs.refresh_every_cycles.max(1),
            matching_enabled: toml_config.matching.enabled,
            matching_url: toml_config.matching.url,
            matching_profile: toml_config.matching.profile,
            matching_timeout_ms: toml_config.matching.timeout_ms,
            matching_radius_m: toml_config.matching.radius_m,
            finalizer_workers: toml_config.finalizer.workers.max(1),
            finalizer_queue_size: toml_config.finalizer.queue_size.max(1),
            store_dir: toml_config.store.dir,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
        })
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Load configuration from an explicit path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn feed_url(&self) -> &str {
        &self.feed_url
    }

    pub fn agency(&self) -> &str {
        &self.agency
    }

    pub fn feed_mode(&self) -> FeedMode {
        self.feed_mode
    }

    pub fn poll_interval_secs(&self) -> u64 {
        self.poll_interval_secs
    }

    pub fn request_timeout_ms(&self) -> u64 {
        self.request_timeout_ms
    }

    pub fn replay(&self) -> Option<&ReplayConfig> {
        self.replay.as_ref()
    }

    pub fn fleet_timeout_secs(&self) -> u64 {
        self.fleet_timeout_secs
    }

    pub fn trip_identity(&self) -> TripIdentity {
        self.trip_identity
    }

    pub fn gtfs_dir(&self) -> &str {
        &self.gtfs_dir
    }

    pub fn refresh_routes(&self) -> bool {
        self.refresh_routes
    }

    pub fn refresh_every_cycles(&self) -> u64 {
        self.refresh_every_cycles
    }

    pub fn matching_enabled(&self) -> bool {
        self.matching_enabled
    }

    pub fn matching_url(&self) -> &str {
        &self.matching_url
    }

    pub fn matching_profile(&self) -> &str {
        &self.matching_profile
    }

    pub fn matching_timeout_ms(&self) -> u64 {
        self.matching_timeout_ms
    }

    pub fn matching_radius_m(&self) -> f64 {
        self.matching_radius_m
    }

    pub fn finalizer_workers(&self) -> usize {
        self.finalizer_workers
    }

    pub fn finalizer_queue_size(&self) -> usize {
        self.finalizer_queue_size
    }

    pub fn store_dir(&self) -> &str {
        &self.store_dir
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    /// Override whether finalization runs (command line takes precedence over file)
    pub fn with_matching_enabled(mut self, enabled: bool) -> Self {
        self.matching_enabled = enabled;
        self
    }

    /// Builder method for tests to set the fleet timeout
    #[cfg(test)]
    pub fn with_fleet_timeout_secs(mut self, secs: u64) -> Self {
        self.fleet_timeout_secs = secs;
        self
    }

    /// Builder method for tests to set the trip identity rule
    #[cfg(test)]
    pub fn with_trip_identity(mut self, identity: TripIdentity) -> Self {
        self.trip_identity = identity;
        self
    }
}
