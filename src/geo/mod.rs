//! Pure geographic math.
//!
//! Everything in this module is deterministic and side-effect free:
//! great-circle distance and bearing on the WGS-84 mean Earth radius,
//! coordinate validity, movement-anomaly checks, and the containment
//! predicates the geofence engine dispatches on.

use crate::geofence::zone::{Geometry, Zone};
use crate::model::Coordinate;

/// Mean Earth radius in meters, as used by the Haversine formula.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Below this displacement a sample is treated as stationary and no
/// heading is derived.
pub const HEADING_NOISE_FLOOR_M: f64 = 1.0;

/// Great-circle distance between two coordinates in meters (Haversine).
///
/// Returns 0 for identical points and is finite for every valid
/// coordinate pair.
pub fn distance_m(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lon = (b.lon - a.lon).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().asin();

    EARTH_RADIUS_M * c
}

/// Initial bearing from `a` to `b` in degrees, normalized to [0, 360).
pub fn bearing_deg(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lon = (b.lon - a.lon).to_radians();

    let y = delta_lon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * delta_lon.cos();

    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// Destination point reached by travelling `distance_m` meters from
/// `origin` along the given initial bearing.
pub fn destination(origin: Coordinate, bearing_deg: f64, distance_m: f64) -> Coordinate {
    let angular = distance_m / EARTH_RADIUS_M;
    let bearing = bearing_deg.to_radians();
    let lat1 = origin.lat.to_radians();
    let lon1 = origin.lon.to_radians();

    let lat2 = (lat1.sin() * angular.cos() + lat1.cos() * angular.sin() * bearing.cos()).asin();
    let lon2 = lon1
        + (bearing.sin() * angular.sin() * lat1.cos())
            .atan2(angular.cos() - lat1.sin() * lat2.sin());

    Coordinate {
        lat: lat2.to_degrees(),
        lon: ((lon2.to_degrees() + 540.0) % 360.0) - 180.0,
    }
}

/// Average speed in km/h over `distance_m` meters and `dt_ms`
/// milliseconds. Returns 0 when the interval is empty.
pub fn speed_kmh(distance_m: f64, dt_ms: i64) -> f64 {
    if dt_ms == 0 {
        return 0.0;
    }
    let hours = dt_ms as f64 / 3_600_000.0;
    (distance_m / 1000.0) / hours
}

/// Range and finiteness check: latitude in [-90, 90], longitude in
/// [-180, 180].
pub fn valid_coordinate(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

/// Whether a displacement looks physically implausible.
///
/// Intervals shorter than one second allow any distance (duplicate or
/// out-of-order deliveries commonly land in the same second); above
/// that, the jump is abnormal iff it exceeds `max_jump_m`.
pub fn abnormal_jump(distance_m: f64, dt_ms: i64, max_jump_m: f64) -> bool {
    if dt_ms < 1000 {
        return false;
    }
    distance_m > max_jump_m
}

/// Closed-disc containment: a point exactly on the boundary is inside.
pub fn point_in_circle(point: Coordinate, center: Coordinate, radius_m: f64) -> bool {
    distance_m(point, center) <= radius_m
}

/// Ray-casting containment test over the polygon's implicit closed
/// ring. The crossing test is evaluated on raw longitude/latitude, so
/// the predicate is a pure function of its inputs.
pub fn point_in_polygon(point: Coordinate, vertices: &[Coordinate]) -> bool {
    if vertices.len() < 3 {
        return false;
    }

    let (x, y) = (point.lon, point.lat);
    let mut inside = false;
    let mut j = vertices.len() - 1;

    for i in 0..vertices.len() {
        let (xi, yi) = (vertices[i].lon, vertices[i].lat);
        let (xj, yj) = (vertices[j].lon, vertices[j].lat);

        if ((yi > y) != (yj > y)) && (x < (xj - xi) * (y - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }

    inside
}

/// Containment dispatch over the zone's geometry.
pub fn point_in_zone(point: Coordinate, zone: &Zone) -> bool {
    match &zone.geometry {
        Geometry::Circular { center, radius_m } => point_in_circle(point, *center, *radius_m),
        Geometry::Polygon { vertices } => point_in_polygon(point, vertices),
    }
}

/// Distance from a point to a zone boundary in meters.
///
/// For discs this is the absolute difference between the center
/// distance and the radius. For polygons it is the minimum distance to
/// any edge, where the closest point on an edge is found by projecting
/// in the flat lon/lat plane and then measured via Haversine.
pub fn distance_to_zone(point: Coordinate, zone: &Zone) -> f64 {
    match &zone.geometry {
        Geometry::Circular { center, radius_m } => (distance_m(point, *center) - radius_m).abs(),
        Geometry::Polygon { vertices } => {
            let mut min = f64::INFINITY;
            for i in 0..vertices.len() {
                let j = (i + 1) % vertices.len();
                let d = point_to_segment_m(point, vertices[i], vertices[j]);
                if d < min {
                    min = d;
                }
            }
            min
        }
    }
}

/// Haversine distance from `p` to the closest point of segment `ab`,
/// with the foot of the perpendicular computed in the flat x=lon,
/// y=lat plane.
fn point_to_segment_m(p: Coordinate, a: Coordinate, b: Coordinate) -> f64 {
    let (px, py) = (p.lon, p.lat);
    let (ax, ay) = (a.lon, a.lat);
    let (bx, by) = (b.lon, b.lat);

    let (dx, dy) = (bx - ax, by - ay);
    let len_sq = dx * dx + dy * dy;

    let t = if len_sq == 0.0 {
        0.0
    } else {
        (((px - ax) * dx + (py - ay) * dy) / len_sq).clamp(0.0, 1.0)
    };

    let foot = Coordinate {
        lat: ay + t * dy,
        lon: ax + t * dx,
    };

    distance_m(p, foot)
}
