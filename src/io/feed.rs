//! Vehicle position feed reader (GTFS-realtime, JSON encoding)
//!
//! Fetches `{url}api/gtfsrt/vehicle_positions?source={agency}` and turns the
//! response into a `FeedSnapshot`. In replay mode a `timestamp` parameter asks
//! the archive for the snapshot closest to that time.

use crate::domain::types::{FeedSnapshot, RawPositionReport, VehicleId};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

/// Errors that abandon a polling cycle
#[derive(Debug, Error)]
pub enum FeedError {
    /// Connection failure, timeout or non-success HTTP status
    #[error("feed request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Feed answered but reported a problem
    #[error("feed status not OK: {0}")]
    Status(String),

    /// Response body is not a valid feed document
    #[error("feed decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Source of per-cycle snapshots
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Fetch the current snapshot, or the archived one nearest `at` (epoch seconds)
    async fn fetch(&self, at: Option<u64>) -> Result<FeedSnapshot, FeedError>;
}

#[derive(Debug, Deserialize)]
struct FeedMessage {
    header: FeedHeader,
    #[serde(default)]
    entity: Option<Vec<FeedEntity>>,
}

#[derive(Debug, Deserialize)]
struct FeedHeader {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, deserialize_with = "deserialize_epoch")]
    timestamp: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FeedEntity {
    #[serde(default)]
    vehicle: Option<VehiclePosition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VehiclePosition {
    #[serde(default)]
    trip: Option<TripDescriptor>,
    #[serde(default)]
    vehicle: Option<VehicleDescriptor>,
    #[serde(default)]
    position: Option<Position>,
    #[serde(default, deserialize_with = "deserialize_epoch")]
    timestamp: Option<u64>,
    /// Reporting delay relative to the header time, for feeds without per-vehicle times
    #[serde(default)]
    secs_since_report: Option<u64>,
    /// Explicit "not operating a route" marker
    #[serde(default)]
    predictable: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TripDescriptor {
    #[serde(default)]
    trip_id: Option<String>,
    #[serde(default)]
    route_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_string")]
    direction_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VehicleDescriptor {
    #[serde(default, deserialize_with = "deserialize_opt_string")]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Position {
    latitude: f64,
    longitude: f64,
}

/// Protobuf JSON encodes uint64 as a string; accept either form
fn deserialize_epoch<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct EpochVisitor;

    impl<'de> Visitor<'de> for EpochVisitor {
        type Value = Option<u64>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or integer epoch timestamp")
        }

        fn visit_none<E: de::Error>(self) -> Result<Option<u64>, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Option<u64>, E> {
            Ok(None)
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Option<u64>, E> {
            value.trim().parse::<u64>().map(Some).map_err(|_| E::custom(format!("bad timestamp {value:?}")))
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Option<u64>, E> {
            Ok(Some(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Option<u64>, E> {
            Ok(u64::try_from(value).ok())
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<Option<u64>, E> {
            Ok((value >= 0.0).then_some(value as u64))
        }
    }

    deserializer.deserialize_any(EpochVisitor)
}

/// Ids and direction ids show up as numbers in some feeds
fn deserialize_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        S(String),
        N(i64),
    }

    Ok(Option::<StringOrNumber>::deserialize(deserializer)?.map(|v| match v {
        StringOrNumber::S(s) => s,
        StringOrNumber::N(n) => n.to_string(),
    }))
}

/// Current epoch seconds with sub-second precision
pub fn epoch_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Parse a feed document.
///
/// `fallback_time` is used as the server time when the header carries no
/// timestamp (live polling uses the request/response midpoint).
pub fn parse_snapshot(body: &[u8], fallback_time: f64) -> Result<FeedSnapshot, FeedError> {
    let message: FeedMessage = serde_json::from_slice(body)?;

    if let Some(status) = &message.header.status {
        if !status.eq_ignore_ascii_case("ok") {
            return Err(FeedError::Status(status.clone()));
        }
    }
    let Some(entities) = message.entity else {
        return Err(FeedError::Status("no entity list".to_string()));
    };

    let server_time = message.header.timestamp.map(|t| t as f64).unwrap_or(fallback_time);
    let feed_timestamp = message.header.timestamp.unwrap_or(fallback_time as u64);

    let mut reports = Vec::with_capacity(entities.len());
    for vehicle in entities.into_iter().filter_map(|e| e.vehicle) {
        let Some(vehicle_id) = vehicle.vehicle.as_ref().and_then(|v| v.id.clone()) else {
            debug!("feed_entity_without_vehicle_id");
            continue;
        };
        let Some(position) = vehicle.position else {
            debug!(vehicle_id = %vehicle_id, "feed_entity_without_position");
            continue;
        };

        let observed_at = match (vehicle.timestamp, vehicle.secs_since_report) {
            (Some(ts), _) => ts as f64,
            (None, Some(delay)) => server_time - delay as f64,
            (None, None) => server_time,
        };

        let (trip_id, route_id, direction_id) = match vehicle.trip {
            Some(trip) => (trip.trip_id, trip.route_id, trip.direction_id),
            None => (None, None, None),
        };
        let on_route = trip_id.is_some() || route_id.is_some();

        reports.push(RawPositionReport {
            vehicle_id: VehicleId(vehicle_id),
            operating: on_route && vehicle.predictable != Some(false),
            route_id,
            direction_id,
            trip_id,
            longitude: position.longitude,
            latitude: position.latitude,
            observed_at,
        });
    }

    Ok(FeedSnapshot { feed_timestamp, server_time, reports })
}

/// HTTP reader for a GTFS-realtime JSON vehicle positions endpoint
pub struct GtfsRtJsonFeed {
    client: reqwest::Client,
    endpoint: String,
    agency: String,
}

impl GtfsRtJsonFeed {
    pub fn new(base_url: &str, agency: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base = if base_url.ends_with('/') { base_url.to_string() } else { format!("{base_url}/") };
        Ok(Self {
            client,
            endpoint: format!("{base}api/gtfsrt/vehicle_positions"),
            agency: agency.to_string(),
        })
    }
}

#[async_trait]
impl FeedSource for GtfsRtJsonFeed {
    async fn fetch(&self, at: Option<u64>) -> Result<FeedSnapshot, FeedError> {
        let request_time = epoch_secs();

        let mut request = self.client.get(&self.endpoint).query(&[("source", self.agency.as_str())]);
        if let Some(t) = at {
            request = request.query(&[("timestamp", t)]);
        }

        let body = request.send().await?.error_for_status()?.bytes().await?;

        // Server generated its report roughly halfway between send and reply
        let midpoint = (request_time + epoch_secs()) / 2.0;
        parse_snapshot(&body, midpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "header": {"status": "OK", "timestamp": "1600000000"},
        "entity": [
            {"vehicle": {
                "trip": {"tripId": "T1", "routeId": "504", "directionId": 1},
                "vehicle": {"id": "4401"},
                "position": {"latitude": 43.65, "longitude": -79.38},
                "timestamp": 1599999990
            }},
            {"vehicle": {
                "vehicle": {"id": "4402"},
                "position": {"latitude": 43.66, "longitude": -79.39},
                "timestamp": "1599999995"
            }},
            {"vehicle": {
                "trip": {"routeId": "505", "directionId": "0"},
                "vehicle": {"id": 4403},
                "position": {"latitude": 43.67, "longitude": -79.40},
                "secsSinceReport": 12
            }},
            {"vehicle": {
                "trip": {"routeId": "505"},
                "vehicle": {"id": "4404"},
                "position": {"latitude": 43.67, "longitude": -79.40},
                "predictable": false
            }},
            {"vehicle": {"vehicle": {"id": "4405"}}}
        ]
    }"#;

    #[test]
    fn test_parse_snapshot() {
        let snapshot = parse_snapshot(SAMPLE.as_bytes(), 0.0).unwrap();

        assert_eq!(snapshot.feed_timestamp, 1_600_000_000);
        assert_eq!(snapshot.server_time, 1_600_000_000.0);
        // Entity without a position is skipped
        assert_eq!(snapshot.reports.len(), 4);

        let first = &snapshot.reports[0];
        assert_eq!(first.vehicle_id, VehicleId::new("4401"));
        assert_eq!(first.trip_id.as_deref(), Some("T1"));
        assert_eq!(first.direction_id.as_deref(), Some("1"));
        assert_eq!(first.observed_at, 1_599_999_990.0);
        assert!(first.operating);
    }

    #[test]
    fn test_vehicle_without_trip_is_not_operating() {
        let snapshot = parse_snapshot(SAMPLE.as_bytes(), 0.0).unwrap();
        let r = &snapshot.reports[1];
        assert_eq!(r.vehicle_id, VehicleId::new("4402"));
        assert!(!r.operating);
        assert_eq!(r.observed_at, 1_599_999_995.0);
    }

    #[test]
    fn test_reporting_delay_offsets_observation() {
        let snapshot = parse_snapshot(SAMPLE.as_bytes(), 0.0).unwrap();
        let r = &snapshot.reports[2];
        assert_eq!(r.vehicle_id, VehicleId::new("4403"));
        assert_eq!(r.observed_at, 1_600_000_000.0 - 12.0);
        assert!(r.operating);
    }

    #[test]
    fn test_unpredictable_vehicle_is_not_operating() {
        let snapshot = parse_snapshot(SAMPLE.as_bytes(), 0.0).unwrap();
        assert!(!snapshot.reports[3].operating);
    }

    #[test]
    fn test_bad_status_is_error() {
        let body = r#"{"header": {"status": "ERROR"}, "entity": []}"#;
        assert!(matches!(parse_snapshot(body.as_bytes(), 0.0), Err(FeedError::Status(_))));
    }

    #[test]
    fn test_missing_entities_is_error() {
        let body = r#"{"header": {"status": "OK", "timestamp": 5}}"#;
        assert!(matches!(parse_snapshot(body.as_bytes(), 0.0), Err(FeedError::Status(_))));
    }

    #[test]
    fn test_missing_header_time_uses_fallback() {
        let body = r#"{"header": {}, "entity": []}"#;
        let snapshot = parse_snapshot(body.as_bytes(), 1234.6).unwrap();
        assert_eq!(snapshot.server_time, 1234.6);
        assert_eq!(snapshot.feed_timestamp, 1234);
    }

    #[test]
    fn test_malformed_body_is_decode_error() {
        assert!(matches!(parse_snapshot(b"<xml/>", 0.0), Err(FeedError::Decode(_))));
    }
}
