// Spherical geometry used by the aggregator and the lap engine

use crate::TracksideError;

/// Mean earth radius in meters, good enough for sub-kilometer legs
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Geohash precision used for every point. Twelve characters resolves to
/// well under a meter, more than the GPS itself can promise.
const GEOHASH_PRECISION: usize = 12;

/// Great-circle distance between two coordinates in meters.
///
/// Uses the haversine formula, which stays numerically stable for the short
/// point-to-point legs produced at telemetry sample rates.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Interior angle (radians) at the vertex whose two adjacent side lengths
/// are `adjacent_a` and `adjacent_b`, with `opposite` the remaining side.
///
/// Solved with the law of cosines from the three known side lengths; the
/// cosine is clamped so floating point noise on a degenerate (collinear)
/// triangle cannot produce NaN.
pub fn interior_angle(adjacent_a: f64, adjacent_b: f64, opposite: f64) -> f64 {
    if adjacent_a <= 0.0 || adjacent_b <= 0.0 {
        return 0.0;
    }
    let cos = ((adjacent_a * adjacent_a + adjacent_b * adjacent_b - opposite * opposite)
        / (2.0 * adjacent_a * adjacent_b))
        .clamp(-1.0, 1.0);
    cos.acos()
}

/// Time in seconds to cover `distance_m` starting at `speed_mps` under
/// constant acceleration `accel_mps2`, i.e. the positive root of
/// `d = v*t + a*t^2/2`.
///
/// Returns infinity when the line is unreachable (decelerating to a stop
/// short of it, or standing still); callers clamp against the sample
/// interval.
pub fn time_to_line_s(distance_m: f64, speed_mps: f64, accel_mps2: f64) -> f64 {
    if distance_m <= 0.0 {
        return 0.0;
    }
    if accel_mps2.abs() < 1e-9 {
        if speed_mps < 1e-9 {
            return f64::INFINITY;
        }
        return distance_m / speed_mps;
    }
    let discriminant = speed_mps * speed_mps + 2.0 * accel_mps2 * distance_m;
    if discriminant < 0.0 {
        return f64::INFINITY;
    }
    (-speed_mps + discriminant.sqrt()) / accel_mps2
}

/// Geospatial hash of a coordinate, stored on every point for indexing in
/// the relational store.
pub fn hash_coordinate(lat: f64, lon: f64) -> Result<String, TracksideError> {
    geohash::encode(geohash::Coord { x: lon, y: lat }, GEOHASH_PRECISION).map_err(|e| {
        TracksideError::GeohashError {
            description: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    #[test]
    fn test_haversine_known_distance() {
        // One degree of latitude is about 111.2km
        let d = haversine_m(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_195.0).abs() < 100.0, "got {}", d);
    }

    #[test]
    fn test_haversine_zero_distance() {
        assert_eq!(haversine_m(45.0, 7.0, 45.0, 7.0), 0.0);
    }

    #[test]
    fn test_haversine_short_leg() {
        // ~1.11m per 0.00001 degree of latitude
        let d = haversine_m(45.0, 7.0, 45.00001, 7.0);
        assert!((d - 1.11).abs() < 0.01, "got {}", d);
    }

    #[test]
    fn test_interior_angle_right_triangle() {
        // 3-4-5 triangle: angle between the 3 and 4 sides is 90 degrees
        let angle = interior_angle(3.0, 4.0, 5.0);
        assert!((angle - FRAC_PI_2).abs() < 1e-9);
    }

    #[test]
    fn test_interior_angle_collinear_ahead() {
        // Vertex with both other points in the same direction
        let angle = interior_angle(1.0, 3.0, 2.0);
        assert!(angle.abs() < 1e-6);
    }

    #[test]
    fn test_interior_angle_collinear_behind() {
        // Vertex between the two other points: straight angle
        let angle = interior_angle(1.0, 2.0, 3.0);
        assert!((angle - PI).abs() < 1e-6);
    }

    #[test]
    fn test_interior_angle_degenerate_side() {
        assert_eq!(interior_angle(0.0, 4.0, 5.0), 0.0);
    }

    #[test]
    fn test_time_to_line_constant_speed() {
        let t = time_to_line_s(5.0, 10.0, 0.0);
        assert!((t - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_time_to_line_accelerating() {
        // d = v*t + a*t^2/2 with v=10, a=2: at t=0.5, d = 5.25
        let t = time_to_line_s(5.25, 10.0, 2.0);
        assert!((t - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_time_to_line_braking_short_of_line() {
        // Decelerating to a stop before the line: unreachable
        let t = time_to_line_s(100.0, 5.0, -10.0);
        assert!(t.is_infinite());
    }

    #[test]
    fn test_time_to_line_stationary() {
        assert!(time_to_line_s(5.0, 0.0, 0.0).is_infinite());
    }

    #[test]
    fn test_hash_coordinate() {
        let hash = hash_coordinate(57.64911, 10.40744).expect("hash");
        assert!(hash.starts_with("u4pruydqqvj"));
        assert_eq!(hash.len(), 12);
    }

    #[test]
    fn test_hash_coordinate_out_of_range() {
        assert!(hash_coordinate(123.0, 0.0).is_err());
    }
}
