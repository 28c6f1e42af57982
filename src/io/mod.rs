//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `feed` - GTFS-realtime vehicle position reader (HTTP/JSON)
//! - `route_catalog` - Static GTFS route, trip and stop metadata
//! - `map_match` - OSRM map-matching client
//! - `store` - Trip persistence and id sequences
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod feed;
pub mod map_match;
pub mod prometheus;
pub mod route_catalog;
pub mod store;

// Re-export commonly used types
pub use feed::{FeedError, FeedSource, GtfsRtJsonFeed};
pub use map_match::{MapMatcher, MatchError, MatchResponse, OsrmClient, TracePoint};
pub use route_catalog::{RouteCatalog, SharedCatalog};
pub use store::{IdAllocator, JsonlTripStore, MemoryTripStore, SequenceAllocator, TripStore};
