//! Great-circle distance helpers

use super::types::TelemetryPoint;
use geo::{Distance, Haversine, Point};

/// Haversine distance between two coordinates in meters
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    Haversine::distance(Point::new(lng1, lat1), Point::new(lng2, lat2))
}

pub fn point_distance_m(a: &TelemetryPoint, b: &TelemetryPoint) -> f64 {
    haversine_m(a.lat, a.lng, b.lat, b.lng)
}

/// Sum of consecutive point-to-point distances along a path
pub fn path_length_m(points: &[TelemetryPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| point_distance_m(&w[0], &w[1]))
        .sum()
}
