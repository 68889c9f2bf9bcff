//! Trip Aggregator
//!
//! Recurring batch pass over the trip event log. A trip is finalized once its
//! last boundary event is older than the quiescence window: its buffered
//! telemetry is binned, metrics computed, the record persisted, and only then
//! is the trip evicted from the cache.
//!
//! Each trip succeeds or fails on its own. A failing trip stays in the cache
//! untouched for the next pass and never aborts its siblings.

use super::binning::summarize_trip;
use super::cache::CacheStore;
use super::db::{PersistenceSink, SinkRecord};
use super::error::{PipelineError, Result};
use super::ingestor::bounded;
use super::notify::{NotificationPublisher, TRIP_PROCESSED};
use super::trip_log::{DeviceKey, TelemetryBuffer, TripEntry, TripEventLog};
use super::types::{CompletedTrip, Timestamp};
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub quiescence_window_ms: i64,
    pub max_ping_distance_m: f64,
    pub side_effect_timeout: Duration,
}

/// Per-pass counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationReport {
    pub devices_scanned: usize,
    pub trips_aggregated: usize,
    /// Last boundary event still inside the quiescence window
    pub trips_quiescing: usize,
    /// Fewer than two boundary events
    pub trips_incomplete: usize,
    /// Persisted, but the log changed before eviction; recomputed next pass
    pub trips_retained: usize,
    pub trips_failed: usize,
}

enum TripResult {
    Evicted,
    Retained,
}

pub struct TripAggregator {
    trips: TripEventLog,
    telemetry: TelemetryBuffer,
    sink: Arc<dyn PersistenceSink>,
    publisher: Arc<dyn NotificationPublisher>,
    settings: AggregatorSettings,

    /// Timestamp function in epoch ms (for testing with mock time)
    now_fn: Box<dyn Fn() -> Timestamp + Send + Sync>,
}

impl TripAggregator {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        sink: Arc<dyn PersistenceSink>,
        publisher: Arc<dyn NotificationPublisher>,
        settings: AggregatorSettings,
    ) -> Self {
        Self::new_with_timestamp_fn(
            cache,
            sink,
            publisher,
            settings,
            Box::new(|| chrono::Utc::now().timestamp_millis()),
        )
    }

    /// Used for testing with deterministic timestamps.
    pub fn new_with_timestamp_fn(
        cache: Arc<dyn CacheStore>,
        sink: Arc<dyn PersistenceSink>,
        publisher: Arc<dyn NotificationPublisher>,
        settings: AggregatorSettings,
        now_fn: Box<dyn Fn() -> Timestamp + Send + Sync>,
    ) -> Self {
        Self {
            trips: TripEventLog::new(cache.clone()),
            telemetry: TelemetryBuffer::new(cache),
            sink,
            publisher,
            settings,
            now_fn,
        }
    }

    pub async fn run_pass(&self) -> AggregationReport {
        let now = (self.now_fn)();
        self.run_pass_at(now).await
    }

    /// One aggregation pass treating `now` as the current time
    pub async fn run_pass_at(&self, now: Timestamp) -> AggregationReport {
        let mut report = AggregationReport::default();

        match self.telemetry.sweep_orphans().await {
            Ok(0) => {}
            Ok(swept) => log::info!("🧹 Cleared {} orphaned telemetry buffers", swept),
            Err(e) => log::warn!("⚠️  Orphaned telemetry sweep stopped early: {}", e),
        }

        let devices = match self.trips.devices().await {
            Ok(devices) => devices,
            Err(e) => {
                log::error!("❌ Failed to load trip index: {}", e);
                return report;
            }
        };

        for device in devices {
            report.devices_scanned += 1;
            self.aggregate_device(&device, now, &mut report).await;
        }

        log::info!(
            "🧮 Aggregation pass: {} devices, {} aggregated, {} quiescing, {} incomplete, {} retained, {} failed",
            report.devices_scanned,
            report.trips_aggregated,
            report.trips_quiescing,
            report.trips_incomplete,
            report.trips_retained,
            report.trips_failed
        );

        report
    }

    async fn aggregate_device(
        &self,
        device: &DeviceKey,
        now: Timestamp,
        report: &mut AggregationReport,
    ) {
        let entries = match self.trips.load_device(device).await {
            Ok(entries) => entries,
            Err(e) => {
                log::error!("❌ Failed to load trips for {}: {}", device, e);
                return;
            }
        };

        // An index entry with no trips left is released below as well
        let mut evicted = usize::from(entries.is_empty());
        for mut entry in entries {
            entry.events.sort_by_key(|e| e.timestamp);

            let last_ts = match entry.events.as_slice() {
                [_, .., last] => last.timestamp,
                _ => {
                    report.trips_incomplete += 1;
                    continue;
                }
            };
            if last_ts.saturating_add(self.settings.quiescence_window_ms) > now {
                report.trips_quiescing += 1;
                continue;
            }

            match self.aggregate_trip(device, &entry).await {
                Ok(TripResult::Evicted) => {
                    report.trips_aggregated += 1;
                    evicted += 1;
                }
                Ok(TripResult::Retained) => report.trips_retained += 1,
                Err(PipelineError::NotFound(msg)) => {
                    log::warn!("⚠️  Trip {} of {} retained: {}", entry.trip_id, device, msg);
                    report.trips_failed += 1;
                }
                Err(e) => {
                    log::error!(
                        "❌ Trip {} of {} failed, retained for retry: {}",
                        entry.trip_id,
                        device,
                        e
                    );
                    report.trips_failed += 1;
                }
            }
        }

        if evicted > 0 {
            match self.trips.release_device_if_empty(device).await {
                Ok(true) => log::debug!("Released trip log for {}", device),
                Ok(false) => {}
                Err(e) => log::warn!("⚠️  Failed to release trip log for {}: {}", device, e),
            }
        }
    }

    async fn aggregate_trip(&self, device: &DeviceKey, entry: &TripEntry) -> Result<TripResult> {
        let points = self.telemetry.load(device, &entry.trip_id).await?;
        if points.is_empty() {
            return Err(PipelineError::NotFound(format!(
                "no telemetry buffered for trip {}",
                entry.trip_id
            )));
        }

        let trip = summarize_trip(
            device,
            &entry.trip_id,
            &entry.events,
            &points,
            self.settings.max_ping_distance_m,
        )
        .ok_or_else(|| {
            PipelineError::NotFound(format!(
                "trip {} has fewer than two boundary events",
                entry.trip_id
            ))
        })?;

        self.persist(&trip).await?;
        self.publish(&trip).await;

        if !self.trips.evict(device, &entry.trip_id, &entry.raw).await? {
            log::info!(
                "Trip {} of {} changed during aggregation, retained for next pass",
                entry.trip_id,
                device
            );
            return Ok(TripResult::Retained);
        }

        if let Err(e) = self.telemetry.clear(device, &entry.trip_id).await {
            log::warn!(
                "⚠️  Failed to clear telemetry for trip {} of {}, queued for sweep: {}",
                entry.trip_id,
                device,
                e
            );
            if let Err(e) = self.telemetry.mark_orphaned(device, &entry.trip_id).await {
                log::error!(
                    "❌ Telemetry for trip {} of {} orphaned: {}",
                    entry.trip_id,
                    device,
                    e
                );
            }
        }

        log::debug!(
            "✅ Trip {} of {} aggregated: {}ms, {:.1}m, {} segments",
            trip.trip_id,
            device,
            trip.duration_ms,
            trip.distance_m,
            trip.segments.len()
        );

        Ok(TripResult::Evicted)
    }

    async fn persist(&self, trip: &CompletedTrip) -> Result<()> {
        let insert = self.sink.insert(SinkRecord::Trip(trip.clone()));
        match bounded("insert trips", self.settings.side_effect_timeout, insert).await {
            Err(PipelineError::Conflict(_)) => {
                log::debug!("Trip {} already persisted", trip.trip_id);
                Ok(())
            }
            other => other,
        }
    }

    async fn publish(&self, trip: &CompletedTrip) {
        let payload = serde_json::json!({
            "provider_id": trip.provider_id,
            "device_id": trip.device_id,
            "trip_id": trip.trip_id,
            "start_time": trip.start_time,
            "end_time": trip.end_time,
            "duration_ms": trip.duration_ms,
            "distance_m": trip.distance_m,
            "violation_count": trip.violation_count,
        });

        let publish = self.publisher.publish(TRIP_PROCESSED, payload);
        let timeout = self.settings.side_effect_timeout;
        if let Err(e) = bounded("publish trip.processed", timeout, publish).await {
            log::warn!("⚠️  Publish failed for trip {}: {}", trip.trip_id, e);
        }
    }
}
