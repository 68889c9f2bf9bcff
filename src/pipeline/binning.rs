//! Telemetry binning and trip metrics
//!
//! A trip with N boundary events has N-1 segments. Segment i covers
//! `[events[i].timestamp, events[i+1].timestamp]`, both ends inclusive, so a
//! point sitting on a boundary belongs to both neighbours. The trip path is
//! every buffered point inside `[start, end]`, seeded with the trip-start fix
//! when the buffer has no point at the start timestamp.

use super::geo_utils::{path_length_m, point_distance_m};
use super::trip_log::DeviceKey;
use super::types::{CompletedTrip, TelemetryPoint, TripBoundaryEvent, TripSegment};

/// Gaps between consecutive points longer than the allowed ping distance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViolationStats {
    pub count: u32,
    pub min_m: Option<f64>,
    pub max_m: Option<f64>,
    pub avg_m: Option<f64>,
}

/// Ordered trip path: points within the trip window, deduplicated by
/// timestamp and seeded with the start fix.
///
/// `events` must be sorted by timestamp and non-empty.
pub fn trip_path(events: &[TripBoundaryEvent], points: &[TelemetryPoint]) -> Vec<TelemetryPoint> {
    let (Some(first), Some(last)) = (events.first(), events.last()) else {
        return Vec::new();
    };
    let (start, end) = (first.timestamp, last.timestamp);

    let mut path: Vec<TelemetryPoint> = points
        .iter()
        .filter(|p| p.timestamp >= start && p.timestamp <= end)
        .cloned()
        .collect();
    path.sort_by_key(|p| p.timestamp);
    path.dedup_by_key(|p| p.timestamp);

    if path.first().map_or(true, |p| p.timestamp != start) {
        path.insert(0, TelemetryPoint::from_gps(start, &first.gps, None));
    }
    path
}

/// Partition a trip path into the segments between consecutive boundary events.
pub fn bin_segments(events: &[TripBoundaryEvent], path: &[TelemetryPoint]) -> Vec<TripSegment> {
    events
        .windows(2)
        .map(|pair| {
            let (lo, hi) = (pair[0].timestamp, pair[1].timestamp);
            TripSegment {
                start_timestamp: lo,
                end_timestamp: hi,
                points: path
                    .iter()
                    .filter(|p| p.timestamp >= lo && p.timestamp <= hi)
                    .cloned()
                    .collect(),
            }
        })
        .collect()
}

pub fn violation_stats(path: &[TelemetryPoint], max_gap_m: f64) -> ViolationStats {
    let gaps: Vec<f64> = path
        .windows(2)
        .map(|w| point_distance_m(&w[0], &w[1]))
        .filter(|gap| *gap > max_gap_m)
        .collect();

    if gaps.is_empty() {
        return ViolationStats::default();
    }

    let min = gaps.iter().copied().fold(f64::INFINITY, f64::min);
    let max = gaps.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let avg = gaps.iter().sum::<f64>() / gaps.len() as f64;

    ViolationStats {
        count: gaps.len() as u32,
        min_m: Some(min),
        max_m: Some(max),
        avg_m: Some(avg),
    }
}

/// Build the completed record for one trip.
///
/// `events` must hold at least two boundary events sorted by timestamp.
pub fn summarize_trip(
    device: &DeviceKey,
    trip_id: &str,
    events: &[TripBoundaryEvent],
    points: &[TelemetryPoint],
    max_gap_m: f64,
) -> Option<CompletedTrip> {
    let (first, last) = match events {
        [first, .., last] => (first, last),
        _ => return None,
    };

    let path = trip_path(events, points);
    let segments = bin_segments(events, &path);
    let violations = violation_stats(&path, max_gap_m);

    Some(CompletedTrip {
        provider_id: device.provider_id.clone(),
        device_id: device.device_id.clone(),
        trip_id: trip_id.to_string(),
        start_time: first.timestamp,
        end_time: last.timestamp,
        start_district: first.district.clone(),
        end_district: last.district.clone(),
        duration_ms: last.timestamp - first.timestamp,
        distance_m: path_length_m(&path),
        violation_count: violations.count,
        min_violation_m: violations.min_m,
        max_violation_m: violations.max_m,
        avg_violation_m: violations.avg_m,
        segments,
    })
}
