//! Trip Event Log and Trip Telemetry Buffer
//!
//! Cache layout:
//! - `device:{provider}:{device}:trips`: hash, trip_id → JSON list of
//!   [`TripBoundaryEvent`] ordered by timestamp
//! - `trip:state`: hash indexing every device that has trips in flight
//! - `trip:{provider}:{device}:{trip_id}:telemetry`: hash, timestamp →
//!   JSON [`TelemetryPoint`]; keying by timestamp deduplicates redelivery
//! - `trip:orphaned`: hash of telemetry keys whose trip was evicted but whose
//!   buffer could not be deleted, swept on the next aggregation pass
//!
//! Boundary lists are rewritten with compare-and-set and evicted with
//! compare-and-delete, so an append racing an eviction is never lost.

use super::cache::CacheStore;
use super::error::{PipelineError, Result};
use super::types::{BoundaryType, TelemetryPoint, Timestamp, TripBoundaryEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const TRIP_INDEX_KEY: &str = "trip:state";
pub const ORPHANED_TELEMETRY_KEY: &str = "trip:orphaned";

const MAX_CAS_ATTEMPTS: usize = 8;

/// Partition key for all trip state: one device of one provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    pub provider_id: String,
    pub device_id: String,
}

impl DeviceKey {
    pub fn new(provider_id: &str, device_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            device_id: device_id.to_string(),
        }
    }

    pub fn trips_key(&self) -> String {
        format!("device:{}:{}:trips", self.provider_id, self.device_id)
    }

    pub fn telemetry_key(&self, trip_id: &str) -> String {
        format!(
            "trip:{}:{}:{}:telemetry",
            self.provider_id, self.device_id, trip_id
        )
    }

    fn index_field(&self) -> String {
        format!("{}:{}", self.provider_id, self.device_id)
    }
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.device_id)
    }
}

/// One trip's boundary events as read from the cache.
///
/// `raw` is the exact cached value, used to guard eviction.
#[derive(Debug, Clone)]
pub struct TripEntry {
    pub trip_id: String,
    pub events: Vec<TripBoundaryEvent>,
    pub raw: String,
}

/// Result of matching a telemetry timestamp to a trip
#[derive(Debug, Clone, PartialEq)]
pub struct TripMatch {
    pub trip_id: String,
    /// False when the trip already ended before the ping's timestamp
    pub open: bool,
    /// Other trips that were also open at the ping's timestamp
    pub competing: Vec<String>,
}

#[derive(Clone)]
pub struct TripEventLog {
    cache: Arc<dyn CacheStore>,
}

impl TripEventLog {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Append a boundary event to a trip.
    ///
    /// Returns `false` when an event with the same timestamp and boundary
    /// type is already recorded.
    pub async fn append(
        &self,
        device: &DeviceKey,
        trip_id: &str,
        event: TripBoundaryEvent,
    ) -> Result<bool> {
        let trips_key = device.trips_key();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.cache.hget(&trips_key, trip_id).await?;
            let mut events = match &current {
                Some(json) => decode_events(device, trip_id, json)?,
                None => Vec::new(),
            };

            let duplicate = events
                .iter()
                .any(|e| e.timestamp == event.timestamp && e.boundary == event.boundary);
            if duplicate {
                return Ok(false);
            }

            let at = events.partition_point(|e| e.timestamp <= event.timestamp);
            events.insert(at, event.clone());
            let encoded = serde_json::to_string(&events)
                .map_err(|e| PipelineError::Validation(e.to_string()))?;

            if self
                .cache
                .hset_if(&trips_key, trip_id, current.as_deref(), &encoded)
                .await?
            {
                self.index_device(device).await?;
                return Ok(true);
            }

            log::debug!("Trip {} for {} changed concurrently, retrying append", trip_id, device);
        }

        Err(PipelineError::TransientStore(format!(
            "trip {} for {} contended after {} attempts",
            trip_id, device, MAX_CAS_ATTEMPTS
        )))
    }

    /// All devices that currently have trips in the log
    pub async fn devices(&self) -> Result<Vec<DeviceKey>> {
        let index = self.cache.hgetall(TRIP_INDEX_KEY).await?;
        let mut devices = Vec::with_capacity(index.len());
        for (field, value) in index {
            match serde_json::from_str::<DeviceKey>(&value) {
                Ok(key) => devices.push(key),
                Err(e) => log::warn!("Skipping unreadable trip index entry {}: {}", field, e),
            }
        }
        devices.sort_by(|a, b| {
            (&a.provider_id, &a.device_id).cmp(&(&b.provider_id, &b.device_id))
        });
        Ok(devices)
    }

    /// Every trip recorded for a device, ordered by trip id
    pub async fn load_device(&self, device: &DeviceKey) -> Result<Vec<TripEntry>> {
        let trips = self.cache.hgetall(&device.trips_key()).await?;
        let mut entries = Vec::with_capacity(trips.len());
        for (trip_id, raw) in trips {
            let events = decode_events(device, &trip_id, &raw)?;
            entries.push(TripEntry {
                trip_id,
                events,
                raw,
            });
        }
        entries.sort_by(|a, b| a.trip_id.cmp(&b.trip_id));
        Ok(entries)
    }

    pub async fn trip_events(
        &self,
        device: &DeviceKey,
        trip_id: &str,
    ) -> Result<Option<Vec<TripBoundaryEvent>>> {
        match self.cache.hget(&device.trips_key(), trip_id).await? {
            Some(json) => Ok(Some(decode_events(device, trip_id, &json)?)),
            None => Ok(None),
        }
    }

    /// Trip a telemetry ping at `timestamp` belongs to: the trip with the
    /// latest `trip_start` at or before it.
    ///
    /// Trips still open at `timestamp` other than the winner are reported in
    /// [`TripMatch::competing`]; nothing here resolves that ambiguity.
    pub async fn match_trip(
        &self,
        device: &DeviceKey,
        timestamp: Timestamp,
    ) -> Result<Option<TripMatch>> {
        let entries = self.load_device(device).await?;

        let mut best: Option<(Timestamp, &str, bool)> = None;
        let mut open_trips: Vec<&str> = Vec::new();

        for entry in &entries {
            let start = entry
                .events
                .iter()
                .filter(|e| e.boundary == BoundaryType::Start && e.timestamp <= timestamp)
                .map(|e| e.timestamp)
                .max();
            let Some(start) = start else {
                continue;
            };

            let ended = entry.events.iter().any(|e| {
                e.boundary == BoundaryType::End && e.timestamp >= start && e.timestamp < timestamp
            });
            if !ended {
                open_trips.push(&entry.trip_id);
            }

            if best.map_or(true, |(ts, _, _)| start > ts) {
                best = Some((start, &entry.trip_id, !ended));
            }
        }

        Ok(best.map(|(_, trip_id, open)| TripMatch {
            trip_id: trip_id.to_string(),
            open,
            competing: open_trips
                .into_iter()
                .filter(|t| *t != trip_id)
                .map(str::to_string)
                .collect(),
        }))
    }

    /// Remove a trip if its boundary list still equals `expected_raw`.
    pub async fn evict(
        &self,
        device: &DeviceKey,
        trip_id: &str,
        expected_raw: &str,
    ) -> Result<bool> {
        self.cache
            .hdel_if(&device.trips_key(), trip_id, expected_raw)
            .await
    }

    /// Drop the device from the trip index once it has no trips left.
    ///
    /// Re-checks after removing the index entry so an append that landed in
    /// between keeps the device discoverable.
    pub async fn release_device_if_empty(&self, device: &DeviceKey) -> Result<bool> {
        let trips_key = device.trips_key();
        if self.cache.hlen(&trips_key).await? > 0 {
            return Ok(false);
        }

        self.cache.hdel(TRIP_INDEX_KEY, &[&device.index_field()]).await?;

        if self.cache.hlen(&trips_key).await? > 0 {
            self.index_device(device).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn index_device(&self, device: &DeviceKey) -> Result<()> {
        let value = serde_json::to_string(device)
            .map_err(|e| PipelineError::Validation(e.to_string()))?;
        self.cache
            .hset(TRIP_INDEX_KEY, &device.index_field(), &value)
            .await
    }
}

/// Raw telemetry points per trip, waiting for the aggregator
#[derive(Clone)]
pub struct TelemetryBuffer {
    cache: Arc<dyn CacheStore>,
}

impl TelemetryBuffer {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Buffer a point. Returns `false` if a point with the same timestamp is
    /// already buffered for the trip.
    pub async fn append(
        &self,
        device: &DeviceKey,
        trip_id: &str,
        point: &TelemetryPoint,
    ) -> Result<bool> {
        let encoded = serde_json::to_string(point)
            .map_err(|e| PipelineError::Validation(e.to_string()))?;
        self.cache
            .hset_if(
                &device.telemetry_key(trip_id),
                &point.timestamp.to_string(),
                None,
                &encoded,
            )
            .await
    }

    /// Buffered points for a trip, ascending by timestamp
    pub async fn load(&self, device: &DeviceKey, trip_id: &str) -> Result<Vec<TelemetryPoint>> {
        let raw = self.cache.hgetall(&device.telemetry_key(trip_id)).await?;
        let mut points = Vec::with_capacity(raw.len());
        for (field, json) in raw {
            let point: TelemetryPoint = serde_json::from_str(&json).map_err(|e| {
                PipelineError::TransientStore(format!(
                    "corrupt telemetry {} for trip {} of {}: {}",
                    field, trip_id, device, e
                ))
            })?;
            points.push(point);
        }
        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }

    pub async fn clear(&self, device: &DeviceKey, trip_id: &str) -> Result<bool> {
        self.cache.del(&device.telemetry_key(trip_id)).await
    }

    /// Remember a buffer that outlived its trip so a later sweep deletes it
    pub async fn mark_orphaned(&self, device: &DeviceKey, trip_id: &str) -> Result<()> {
        self.cache
            .hset(ORPHANED_TELEMETRY_KEY, &device.telemetry_key(trip_id), trip_id)
            .await
    }

    /// Delete every orphaned buffer. A key is forgotten only after its buffer
    /// is gone; the first failure stops the sweep and leaves the rest queued.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let orphans = self.cache.hgetall(ORPHANED_TELEMETRY_KEY).await?;
        let mut swept = 0;
        for key in orphans.keys() {
            self.cache.del(key).await?;
            self.cache.hdel(ORPHANED_TELEMETRY_KEY, &[key.as_str()]).await?;
            swept += 1;
        }
        Ok(swept)
    }
}

fn decode_events(device: &DeviceKey, trip_id: &str, json: &str) -> Result<Vec<TripBoundaryEvent>> {
    serde_json::from_str(json).map_err(|e| {
        PipelineError::TransientStore(format!(
            "corrupt boundary list for trip {} of {}: {}",
            trip_id, device, e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::cache::InMemoryCache;
    use crate::pipeline::types::{EventType, Gps};

    async fn cache() -> Arc<dyn CacheStore> {
        let cache = Arc::new(InMemoryCache::new());
        cache.initialize().await.unwrap();
        cache
    }

    fn boundary(ts: i64, event_type: EventType) -> TripBoundaryEvent {
        TripBoundaryEvent {
            timestamp: ts,
            boundary: event_type.boundary().unwrap(),
            event_type,
            reason: None,
            district: None,
            gps: Gps::new(34.0, -118.0),
        }
    }

    fn point(ts: i64) -> TelemetryPoint {
        TelemetryPoint {
            timestamp: ts,
            lat: 34.0,
            lng: -118.0,
            annotation: None,
        }
    }

    #[tokio::test]
    async fn test_append_keeps_events_ordered_and_deduplicated() {
        let log = TripEventLog::new(cache().await);
        let device = DeviceKey::new("p", "d");

        assert!(log.append(&device, "t1", boundary(3000, EventType::TripEnd)).await.unwrap());
        assert!(log.append(&device, "t1", boundary(1000, EventType::TripStart)).await.unwrap());
        assert!(!log.append(&device, "t1", boundary(3000, EventType::TripEnd)).await.unwrap());

        let events = log.trip_events(&device, "t1").await.unwrap().unwrap();
        let timestamps: Vec<i64> = events.iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, vec![1000, 3000]);
        assert_eq!(log.devices().await.unwrap(), vec![device]);
    }

    #[tokio::test]
    async fn test_match_trip_latest_start_wins() {
        let log = TripEventLog::new(cache().await);
        let device = DeviceKey::new("p", "d");

        log.append(&device, "t1", boundary(1000, EventType::TripStart)).await.unwrap();
        log.append(&device, "t1", boundary(2000, EventType::TripEnd)).await.unwrap();
        log.append(&device, "t2", boundary(5000, EventType::TripStart)).await.unwrap();

        assert_eq!(log.match_trip(&device, 500).await.unwrap(), None);

        let early = log.match_trip(&device, 1500).await.unwrap().unwrap();
        assert_eq!(early.trip_id, "t1");
        assert!(early.open);
        assert!(early.competing.is_empty());

        let after_end = log.match_trip(&device, 2500).await.unwrap().unwrap();
        assert_eq!(after_end.trip_id, "t1");
        assert!(!after_end.open);

        let late = log.match_trip(&device, 6000).await.unwrap().unwrap();
        assert_eq!(late.trip_id, "t2");
        assert!(late.competing.is_empty());
    }

    #[tokio::test]
    async fn test_match_trip_reports_competing_open_trips() {
        let log = TripEventLog::new(cache().await);
        let device = DeviceKey::new("p", "d");

        log.append(&device, "t1", boundary(1000, EventType::TripStart)).await.unwrap();
        log.append(&device, "t2", boundary(2000, EventType::TripStart)).await.unwrap();

        let matched = log.match_trip(&device, 3000).await.unwrap().unwrap();
        assert_eq!(matched.trip_id, "t2");
        assert_eq!(matched.competing, vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn test_evict_refuses_changed_list() {
        let log = TripEventLog::new(cache().await);
        let device = DeviceKey::new("p", "d");

        log.append(&device, "t1", boundary(1000, EventType::TripStart)).await.unwrap();
        let snapshot = log.load_device(&device).await.unwrap().remove(0);

        // Append lands between read and evict
        log.append(&device, "t1", boundary(2000, EventType::TripEnd)).await.unwrap();
        assert!(!log.evict(&device, "t1", &snapshot.raw).await.unwrap());
        assert_eq!(log.trip_events(&device, "t1").await.unwrap().unwrap().len(), 2);

        let fresh = log.load_device(&device).await.unwrap().remove(0);
        assert!(log.evict(&device, "t1", &fresh.raw).await.unwrap());
        assert!(log.release_device_if_empty(&device).await.unwrap());
        assert!(log.devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_keeps_device_with_remaining_trips() {
        let log = TripEventLog::new(cache().await);
        let device = DeviceKey::new("p", "d");
        log.append(&device, "t1", boundary(1000, EventType::TripStart)).await.unwrap();

        assert!(!log.release_device_if_empty(&device).await.unwrap());
        assert_eq!(log.devices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_telemetry_buffer_dedupes_by_timestamp() {
        let buffer = TelemetryBuffer::new(cache().await);
        let device = DeviceKey::new("p", "d");

        assert!(buffer.append(&device, "t1", &point(2000)).await.unwrap());
        assert!(buffer.append(&device, "t1", &point(1000)).await.unwrap());
        assert!(!buffer.append(&device, "t1", &point(2000)).await.unwrap());

        let loaded = buffer.load(&device, "t1").await.unwrap();
        assert_eq!(loaded.iter().map(|p| p.timestamp).collect::<Vec<_>>(), vec![1000, 2000]);

        assert!(buffer.clear(&device, "t1").await.unwrap());
        assert!(buffer.load(&device, "t1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_buffer_swept() {
        let cache = cache().await;
        let buffer = TelemetryBuffer::new(cache.clone());
        let device = DeviceKey::new("p", "d");
        buffer.append(&device, "t1", &point(1000)).await.unwrap();

        buffer.mark_orphaned(&device, "t1").await.unwrap();
        assert_eq!(buffer.sweep_orphans().await.unwrap(), 1);

        assert!(buffer.load(&device, "t1").await.unwrap().is_empty());
        assert!(cache.hgetall(ORPHANED_TELEMETRY_KEY).await.unwrap().is_empty());
        assert_eq!(buffer.sweep_orphans().await.unwrap(), 0);
    }
}
