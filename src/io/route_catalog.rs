//! Route/trip metadata from a static GTFS directory
//!
//! Resolves the feed's external trip identifiers to `(route_id, direction_id)`
//! and provides the ordered stop pattern for each route direction.

use crate::domain::trip::ResolvedRoute;
use crate::domain::types::{RawPositionReport, StopPoint};
use anyhow::Context;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Catalog shared between the poller (resolution, reload) and finalizers (stops)
pub type SharedCatalog = Arc<RwLock<RouteCatalog>>;

#[derive(Debug, Deserialize)]
struct TripRow {
    route_id: String,
    trip_id: String,
    #[serde(default)]
    direction_id: String,
}

#[derive(Debug, Deserialize)]
struct StopRow {
    stop_id: String,
    stop_lat: f64,
    stop_lon: f64,
}

#[derive(Debug, Deserialize)]
struct StopTimeRow {
    trip_id: String,
    stop_id: String,
    stop_sequence: u32,
}

/// Static route metadata
#[derive(Debug, Default)]
pub struct RouteCatalog {
    /// External trip id -> (route_id, direction_id)
    trips: FxHashMap<String, (String, String)>,
    routes: FxHashSet<String>,
    /// (route_id, direction_id) -> stops ordered by sequence
    patterns: FxHashMap<(String, String), Vec<StopPoint>>,
}

impl RouteCatalog {
    /// Load `trips.txt`, `stops.txt` and `stop_times.txt` from a GTFS directory
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let mut catalog = Self::default();

        let trip_rows: Vec<TripRow> = read_csv(&dir.join("trips.txt"))?;
        for row in &trip_rows {
            catalog.insert_trip(&row.trip_id, &row.route_id, &row.direction_id);
        }

        let stops: FxHashMap<String, (f64, f64)> = read_csv::<StopRow>(&dir.join("stops.txt"))?
            .into_iter()
            .map(|s| (s.stop_id, (s.stop_lon, s.stop_lat)))
            .collect();

        let mut by_trip: FxHashMap<String, Vec<StopTimeRow>> = FxHashMap::default();
        for row in read_csv::<StopTimeRow>(&dir.join("stop_times.txt"))? {
            by_trip.entry(row.trip_id.clone()).or_default().push(row);
        }

        // The longest trip of each route direction stands for its stop pattern
        for (trip_id, mut rows) in by_trip {
            let Some((route_id, direction_id)) = catalog.trips.get(&trip_id).cloned() else {
                continue;
            };
            let key = (route_id, direction_id);
            if catalog.patterns.get(&key).is_some_and(|p| p.len() >= rows.len()) {
                continue;
            }
            rows.sort_by_key(|r| r.stop_sequence);
            let pattern = rows
                .into_iter()
                .filter_map(|r| {
                    let &(lon, lat) = stops.get(&r.stop_id)?;
                    Some(StopPoint { stop_id: r.stop_id, sequence: r.stop_sequence, longitude: lon, latitude: lat })
                })
                .collect();
            catalog.patterns.insert(key, pattern);
        }

        info!(
            dir = %dir.display(),
            trips = %catalog.trips.len(),
            routes = %catalog.routes.len(),
            patterns = %catalog.patterns.len(),
            "route_catalog_loaded"
        );
        Ok(catalog)
    }

    pub fn insert_trip(&mut self, trip_id: &str, route_id: &str, direction_id: &str) {
        self.routes.insert(route_id.to_string());
        self.trips.insert(trip_id.to_string(), (route_id.to_string(), direction_id.to_string()));
    }

    pub fn insert_pattern(&mut self, route_id: &str, direction_id: &str, stops: Vec<StopPoint>) {
        self.routes.insert(route_id.to_string());
        self.patterns.insert((route_id.to_string(), direction_id.to_string()), stops);
    }

    /// Resolve a raw report to its route and direction.
    ///
    /// With a trip id the catalog is authoritative: unknown ids resolve to `None`.
    /// Without one, the report's own route/direction is used; a direction is
    /// required, and when the catalog knows any routes the route must be one of them.
    pub fn resolve(&self, report: &RawPositionReport) -> Option<ResolvedRoute> {
        if let Some(trip_id) = &report.trip_id {
            let (route_id, direction_id) = self.trips.get(trip_id)?;
            return Some(ResolvedRoute {
                route_id: route_id.clone(),
                direction_id: direction_id.clone(),
                external_trip_id: Some(trip_id.clone()),
            });
        }

        let route_id = report.route_id.as_ref()?;
        let direction_id = report.direction_id.as_ref()?;
        if !self.routes.is_empty() && !self.routes.contains(route_id) {
            return None;
        }
        Some(ResolvedRoute {
            route_id: route_id.clone(),
            direction_id: direction_id.clone(),
            external_trip_id: None,
        })
    }

    /// Ordered stops for a route direction (empty if unknown)
    pub fn stops_for(&self, route_id: &str, direction_id: &str) -> &[StopPoint] {
        self.patterns
            .get(&(route_id.to_string(), direction_id.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn trip_count(&self) -> usize {
        self.trips.len()
    }
}

fn read_csv<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    reader
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .with_context(|| format!("Failed to parse {}", path.display()))
}
