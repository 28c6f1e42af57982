//! Map-matching client (OSRM `match` service)
//!
//! Sends the surviving reports of a clean trip and returns the raw response;
//! deciding what a response means for the trip is the finalizer's job.

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Write;
use std::time::Duration;
use thiserror::Error;

/// Errors talking to the matching service
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("match request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("match response undecodable: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("match request needs at least two points, got {0}")]
    TooFewPoints(usize),
}

/// One point of the trace to match
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TracePoint {
    pub longitude: f64,
    pub latitude: f64,
    /// Epoch seconds
    pub time: f64,
}

/// Service response (fields consumed by the finalizer only)
#[derive(Debug, Clone, Deserialize)]
pub struct MatchResponse {
    pub code: String,
    #[serde(default)]
    pub matchings: Vec<Matching>,
    /// One entry per input point; `None` where the point could not be matched
    #[serde(default)]
    pub tracepoints: Vec<Option<Tracepoint>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Matching {
    pub confidence: f64,
    pub geometry: LineGeometry,
}

/// GeoJSON LineString
#[derive(Debug, Clone, Deserialize)]
pub struct LineGeometry {
    pub coordinates: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tracepoint {
    /// `[lon, lat]` snapped onto the network
    pub location: [f64; 2],
}

/// Request/response contract of the matching collaborator
#[async_trait]
pub trait MapMatcher: Send + Sync {
    async fn match_trace(&self, points: &[TracePoint]) -> Result<MatchResponse, MatchError>;
}

/// HTTP client for an OSRM server
pub struct OsrmClient {
    client: reqwest::Client,
    base_url: String,
    profile: String,
    radius_m: f64,
}

impl OsrmClient {
    pub fn new(base_url: &str, profile: &str, radius_m: f64, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            profile: profile.to_string(),
            radius_m,
        })
    }

    /// Build the request URL for a trace
    fn request_url(&self, points: &[TracePoint]) -> String {
        let mut coords = String::with_capacity(points.len() * 24);
        let mut timestamps = String::with_capacity(points.len() * 11);
        let mut radiuses = String::with_capacity(points.len() * 4);

        for (i, p) in points.iter().enumerate() {
            if i > 0 {
                coords.push(';');
                timestamps.push(';');
                radiuses.push(';');
            }
            let _ = write!(coords, "{:.6},{:.6}", p.longitude, p.latitude);
            let _ = write!(timestamps, "{}", p.time.round() as i64);
            let _ = write!(radiuses, "{}", self.radius_m);
        }

        format!(
            "{}/match/v1/{}/{}?timestamps={}&radiuses={}&geometries=geojson&overview=full&gaps=ignore",
            self.base_url, self.profile, coords, timestamps, radiuses
        )
    }
}

#[async_trait]
impl MapMatcher for OsrmClient {
    async fn match_trace(&self, points: &[TracePoint]) -> Result<MatchResponse, MatchError> {
        if points.len() < 2 {
            return Err(MatchError::TooFewPoints(points.len()));
        }
        // OSRM answers 4xx with a JSON body carrying the error code, so no status check
        let body = self.client.get(self.request_url(points)).send().await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
