//! Boundary geometry: validation, area, centroid and containment tests.
//!
//! All functions here are pure and operate on an ordered vertex list. The
//! polygon is treated as implicitly closed (last vertex connects back to the
//! first).
//!
//! ## Approximations
//! - `area` uses a spherical-excess accumulation that is accurate for the
//!   small-to-medium areas this engine accepts; it is not a geodesically
//!   exact formula.
//! - `centroid` is the arithmetic mean of the vertices. For concave polygons
//!   it can fall outside the boundary; callers that need a guaranteed
//!   interior point must not rely on it.

use crate::error::BoundaryError;
use crate::geo_utils::{haversine_distance, EARTH_RADIUS_M};
use crate::GeoPoint;

/// Minimum number of boundary vertices.
pub const MIN_BOUNDARY_POINTS: usize = 3;
/// Maximum number of boundary vertices.
pub const MAX_BOUNDARY_POINTS: usize = 100;
/// Minimum enclosed area in square meters.
pub const MIN_BOUNDARY_AREA_M2: f64 = 100.0;
/// Maximum enclosed area in square meters.
pub const MAX_BOUNDARY_AREA_M2: f64 = 1_000_000.0;

/// Planar shoelace magnitude (in squared degrees) below which the vertex
/// list is considered collinear.
const DEGENERATE_EPSILON: f64 = 1e-7;

/// Validate a proposed boundary.
///
/// Checks run in order: vertex count, coordinate ranges, consecutive
/// duplicates, degeneracy, enclosed-area bounds. The first failing check is
/// reported; success means all checks passed.
pub fn validate(points: &[GeoPoint]) -> Result<(), BoundaryError> {
    if points.len() < MIN_BOUNDARY_POINTS {
        return Err(BoundaryError::TooFewPoints {
            count: points.len(),
            minimum: MIN_BOUNDARY_POINTS,
        });
    }
    if points.len() > MAX_BOUNDARY_POINTS {
        return Err(BoundaryError::TooManyPoints {
            count: points.len(),
            maximum: MAX_BOUNDARY_POINTS,
        });
    }

    for (index, point) in points.iter().enumerate() {
        if !point.is_valid() {
            return Err(BoundaryError::InvalidCoordinate {
                index,
                latitude: point.latitude,
                longitude: point.longitude,
            });
        }
    }

    for (index, pair) in points.windows(2).enumerate() {
        if pair[0].latitude == pair[1].latitude && pair[0].longitude == pair[1].longitude {
            return Err(BoundaryError::DuplicateConsecutivePoint { index });
        }
    }

    if shoelace_sum(points).abs() < DEGENERATE_EPSILON {
        return Err(BoundaryError::DegenerateArea);
    }

    let area_m2 = area(points);
    if area_m2 < MIN_BOUNDARY_AREA_M2 {
        return Err(BoundaryError::AreaTooSmall {
            area_m2,
            minimum_m2: MIN_BOUNDARY_AREA_M2,
        });
    }
    if area_m2 > MAX_BOUNDARY_AREA_M2 {
        return Err(BoundaryError::AreaTooLarge {
            area_m2,
            maximum_m2: MAX_BOUNDARY_AREA_M2,
        });
    }

    Ok(())
}

/// Signed planar shoelace sum over the closed ring, in squared degrees.
///
/// Only used as a degeneracy detector; the magnitude is twice the planar
/// area the vertex list would enclose on a flat lat/lon grid.
fn shoelace_sum(points: &[GeoPoint]) -> f64 {
    let n = points.len();
    let mut sum = 0.0;
    for i in 0..n {
        let a = &points[i];
        let b = &points[(i + 1) % n];
        sum += a.longitude * b.latitude - b.longitude * a.latitude;
    }
    sum
}

/// Approximate enclosed area of the boundary in square meters.
///
/// Spherical-excess accumulation: for each edge, accumulate
/// `(lon2 - lon1) * (2 + sin(lat1) + sin(lat2))` in radians, then scale by
/// Earth-radius squared over two and take the absolute value.
pub fn area(points: &[GeoPoint]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }

    let n = points.len();
    let mut sum = 0.0;
    for i in 0..n {
        let a = &points[i];
        let b = &points[(i + 1) % n];
        let lon1 = a.longitude.to_radians();
        let lon2 = b.longitude.to_radians();
        let lat1 = a.latitude.to_radians();
        let lat2 = b.latitude.to_radians();
        sum += (lon2 - lon1) * (2.0 + lat1.sin() + lat2.sin());
    }

    (sum * EARTH_RADIUS_M * EARTH_RADIUS_M / 2.0).abs()
}

/// Centroid of the boundary as the arithmetic mean of its vertices.
pub fn centroid(points: &[GeoPoint]) -> GeoPoint {
    if points.is_empty() {
        return GeoPoint::new(0.0, 0.0);
    }

    let lat_sum: f64 = points.iter().map(|p| p.latitude).sum();
    let lon_sum: f64 = points.iter().map(|p| p.longitude).sum();
    let n = points.len() as f64;

    GeoPoint::new(lat_sum / n, lon_sum / n)
}

/// Even-odd ray-casting containment test.
///
/// Longitude is the horizontal axis, latitude the vertical one. An edge is
/// considered to cover the half-open latitude interval between its
/// endpoints, so a test point whose latitude equals a vertex latitude
/// crosses exactly one of the two edges meeting at that vertex. Points
/// exactly on an edge are resolved by the same rule rather than treated
/// specially.
pub fn contains(point: &GeoPoint, polygon: &[GeoPoint]) -> bool {
    if polygon.len() < 3 {
        return false;
    }

    let x = point.longitude;
    let y = point.latitude;
    let n = polygon.len();
    let mut inside = false;

    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (polygon[i].longitude, polygon[i].latitude);
        let (xj, yj) = (polygon[j].longitude, polygon[j].latitude);

        if (yi > y) != (yj > y) {
            let edge_lon = xi + (y - yi) / (yj - yi) * (xj - xi);
            if x < edge_lon {
                inside = !inside;
            }
        }
        j = i;
    }

    inside
}

/// Largest great-circle distance from `center` to any vertex, in meters.
///
/// Used to derive the monitored-region radius for a boundary.
pub fn max_vertex_distance(center: &GeoPoint, points: &[GeoPoint]) -> f64 {
    points
        .iter()
        .map(|p| haversine_distance(center, p))
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Axis-aligned square as (lat, lon) vertices.
    fn square(lat: f64, lon: f64, side_deg: f64) -> Vec<GeoPoint> {
        vec![
            GeoPoint::new(lat, lon),
            GeoPoint::new(lat, lon + side_deg),
            GeoPoint::new(lat + side_deg, lon + side_deg),
            GeoPoint::new(lat + side_deg, lon),
        ]
    }

    #[test]
    fn test_contains_unit_square() {
        let polygon = vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 10.0),
            GeoPoint::new(10.0, 10.0),
            GeoPoint::new(10.0, 0.0),
        ];

        assert!(contains(&GeoPoint::new(5.0, 5.0), &polygon));
        assert!(!contains(&GeoPoint::new(5.0, 15.0), &polygon));
        assert!(!contains(&GeoPoint::new(15.0, 5.0), &polygon));
        assert!(!contains(&GeoPoint::new(-5.0, 5.0), &polygon));
    }

    #[test]
    fn test_contains_triangle() {
        let polygon = vec![
            GeoPoint::new(0.0, 5.0),
            GeoPoint::new(10.0, 0.0),
            GeoPoint::new(10.0, 10.0),
        ];

        assert!(contains(&GeoPoint::new(6.67, 5.0), &polygon));
        assert!(!contains(&GeoPoint::new(2.0, 2.0), &polygon));
    }

    #[test]
    fn test_validate_too_few_points() {
        let points = vec![GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 1.0)];
        assert_eq!(
            validate(&points),
            Err(BoundaryError::TooFewPoints {
                count: 2,
                minimum: 3
            })
        );
    }

    #[test]
    fn test_validate_too_many_points() {
        let points: Vec<GeoPoint> = (0..101)
            .map(|i| GeoPoint::new(i as f64 * 0.0001, (i % 7) as f64 * 0.0001))
            .collect();
        assert!(matches!(
            validate(&points),
            Err(BoundaryError::TooManyPoints { count: 101, .. })
        ));
    }

    #[test]
    fn test_validate_invalid_coordinate() {
        let points = vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(91.0, 0.0),
            GeoPoint::new(0.0, 1.0),
        ];
        assert!(matches!(
            validate(&points),
            Err(BoundaryError::InvalidCoordinate { index: 1, .. })
        ));
    }

    #[test]
    fn test_validate_duplicate_consecutive() {
        let points = vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0004, 0.0004),
        ];
        assert_eq!(
            validate(&points),
            Err(BoundaryError::DuplicateConsecutivePoint { index: 0 })
        );
    }

    #[test]
    fn test_validate_degenerate_collinear() {
        let points = vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 0.001),
            GeoPoint::new(0.0, 0.002),
        ];
        assert_eq!(validate(&points), Err(BoundaryError::DegenerateArea));
    }

    #[test]
    fn test_validate_accepts_plausible_boundary() {
        // ~44m square at the equator, roughly 2,000 m²
        let points = square(0.0, 0.0, 0.0004);
        let area_m2 = area(&points);
        assert!(area_m2 > MIN_BOUNDARY_AREA_M2 && area_m2 < MAX_BOUNDARY_AREA_M2);
        assert_eq!(validate(&points), Ok(()));
    }

    #[test]
    fn test_validate_area_too_small() {
        // Same angular size near the pole encloses far less ground
        let points = square(89.0, 0.0, 0.0004);
        assert!(matches!(
            validate(&points),
            Err(BoundaryError::AreaTooSmall { .. })
        ));
    }

    #[test]
    fn test_validate_area_too_large() {
        // ~2.2km square at the equator, several km²
        let points = square(0.0, 0.0, 0.02);
        assert!(matches!(
            validate(&points),
            Err(BoundaryError::AreaTooLarge { .. })
        ));
    }

    #[test]
    fn test_area_scales_with_size() {
        let small = area(&square(0.0, 0.0, 0.0004));
        let large = area(&square(0.0, 0.0, 0.0008));
        // Doubling the side roughly quadruples the area
        assert!((large / small - 4.0).abs() < 0.01);
    }

    #[test]
    fn test_centroid_is_vertex_mean() {
        let points = vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 10.0),
            GeoPoint::new(10.0, 10.0),
            GeoPoint::new(10.0, 0.0),
        ];
        let c = centroid(&points);
        assert_eq!(c.latitude, 5.0);
        assert_eq!(c.longitude, 5.0);
    }

    #[test]
    fn test_max_vertex_distance() {
        let points = square(0.0, 0.0, 0.0004);
        let c = centroid(&points);
        let radius = max_vertex_distance(&c, &points);
        // Half-diagonal of a ~44m square is ~31m
        assert!(radius > 25.0 && radius < 40.0);
    }
}
