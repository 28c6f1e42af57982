//! Great-circle distances and linear referencing along a matched line
//!
//! Coordinates are `[lon, lat]` in degrees throughout, matching GeoJSON order.

use geo::{Closest, ClosestPoint, Coord, Distance, Haversine, LineLocatePoint, LineString, Point};

/// Mean earth radius used by `geo`'s haversine, metres
const EARTH_RADIUS_M: f64 = 6_371_008.8;

fn point(c: [f64; 2]) -> Point<f64> {
    Point::new(c[0], c[1])
}

/// Great-circle distance in metres
pub fn haversine_m(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    Haversine::distance(Point::new(lon1, lat1), Point::new(lon2, lat2))
}

/// Great-circle distance in kilometres
#[inline]
pub fn haversine_km(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    haversine_m(lon1, lat1, lon2, lat2) / 1000.0
}

/// Where a point falls on a line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    /// Metres along the line from its first vertex
    pub measure_m: f64,
    /// Metres from the point to the line
    pub offset_m: f64,
}

/// Project `at` onto the closest part of `line`.
///
/// The line is flattened into metres with an equirectangular approximation
/// centred on `at`, which is accurate at the scale of a street segment. The
/// located fraction is then scaled by the line's haversine length. Returns
/// `None` for an empty line or when no single closest point exists.
pub fn project(line: &[[f64; 2]], at: [f64; 2]) -> Option<Projection> {
    let (first, rest) = line.split_first()?;
    if rest.is_empty() {
        return Some(Projection { measure_m: 0.0, offset_m: Haversine::distance(point(*first), point(at)) });
    }

    let k = EARTH_RADIUS_M.to_radians();
    let cos_lat = at[1].to_radians().cos();
    let local: LineString<f64> = line
        .iter()
        .map(|c| Coord { x: (c[0] - at[0]) * cos_lat * k, y: (c[1] - at[1]) * k })
        .collect();
    let origin = Point::new(0.0, 0.0);

    let nearest = match local.closest_point(&origin) {
        Closest::Intersection(p) | Closest::SinglePoint(p) => p,
        Closest::Indeterminate => return None,
    };
    let fraction = local.line_locate_point(&origin).filter(|f| f.is_finite()).unwrap_or(0.0);
    let length_m: f64 = line.windows(2).map(|w| Haversine::distance(point(w[0]), point(w[1]))).sum();

    Some(Projection { measure_m: fraction * length_m, offset_m: nearest.x().hypot(nearest.y()) })
}
