//! Event Ingestor
//!
//! Stateless per-ping processor. For one validated ping it:
//! 1. reads the device's cached state and drops exact redeliveries
//! 2. resolves the geofence annotation
//! 3. appends trip boundary events (and their fix) to the trip log / buffer,
//!    or matches telemetry to its trip and buffers it
//! 4. writes the new device state if ordering allows
//! 5. writes the audit snapshot and publishes `device.processed`
//!
//! Only step 5 is isolated: its failures are captured in the
//! [`SideEffectReport`] and logged. Every cache failure propagates.

use super::cache::CacheStore;
use super::db::{PersistenceSink, SinkRecord};
use super::device_state::{DeviceStateStore, PutOutcome};
use super::error::{PipelineError, Result};
use super::geography::GeographyLookup;
use super::notify::{NotificationPublisher, DEVICE_PROCESSED};
use super::state::{derive_state, is_duplicate, supersedes};
use super::trip_log::{DeviceKey, TelemetryBuffer, TripEventLog};
use super::types::{
    DeviceState, EventPing, EventType, GeoAnnotation, Gps, Ping, TelemetryPing, TelemetryPoint,
    TripBoundaryEvent,
};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Device state updated
    Applied,
    /// Older than the cached state; trip log may still have been updated
    Stale,
    /// Exact redelivery, nothing touched
    Duplicate,
    /// Device state removed
    Decommissioned,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Applied => "applied",
            Disposition::Stale => "stale",
            Disposition::Duplicate => "duplicate",
            Disposition::Decommissioned => "decommissioned",
        }
    }
}

/// Outcome of the isolated side effects of one ping
#[derive(Debug)]
pub struct SideEffectReport {
    pub audit: Result<()>,
    pub publish: Result<()>,
}

impl SideEffectReport {
    pub fn all_ok(&self) -> bool {
        self.audit.is_ok() && self.publish.is_ok()
    }
}

#[derive(Debug)]
pub struct IngestOutcome {
    pub disposition: Disposition,
    /// Trip the ping was attributed to, if any
    pub trip_id: Option<String>,
    /// `None` for duplicates, which skip side effects
    pub side_effects: Option<SideEffectReport>,
}

/// Run `fut` with a deadline; an elapsed deadline becomes `PipelineError::Timeout`.
pub async fn bounded<T, F>(operation: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[derive(Clone)]
pub struct EventIngestor {
    devices: DeviceStateStore,
    trips: TripEventLog,
    telemetry: TelemetryBuffer,
    sink: Arc<dyn PersistenceSink>,
    publisher: Arc<dyn NotificationPublisher>,
    geography: Arc<dyn GeographyLookup>,
    side_effect_timeout: Duration,
}

impl EventIngestor {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        sink: Arc<dyn PersistenceSink>,
        publisher: Arc<dyn NotificationPublisher>,
        geography: Arc<dyn GeographyLookup>,
        side_effect_timeout: Duration,
    ) -> Self {
        Self {
            devices: DeviceStateStore::new(cache.clone()),
            trips: TripEventLog::new(cache.clone()),
            telemetry: TelemetryBuffer::new(cache),
            sink,
            publisher,
            geography,
            side_effect_timeout,
        }
    }

    pub fn devices(&self) -> &DeviceStateStore {
        &self.devices
    }

    pub fn trip_log(&self) -> &TripEventLog {
        &self.trips
    }

    pub fn telemetry(&self) -> &TelemetryBuffer {
        &self.telemetry
    }

    /// Parse, validate and ingest one JSON-encoded ping
    pub async fn ingest_json(&self, payload: &str) -> Result<IngestOutcome> {
        let ping = Ping::from_json(payload)?;
        self.ingest(ping).await
    }

    pub async fn ingest(&self, ping: Ping) -> Result<IngestOutcome> {
        let current = self.devices.get(ping.device_id()).await?;

        if let Some(current) = &current {
            if is_duplicate(current, &ping) {
                log::debug!(
                    "Duplicate {} ping for {} at {}, skipping",
                    ping.kind().as_str(),
                    ping.device_id(),
                    ping.timestamp()
                );
                return Ok(IngestOutcome {
                    disposition: Disposition::Duplicate,
                    trip_id: current.trip_id.clone(),
                    side_effects: None,
                });
            }
        }

        let annotation = ping.gps().and_then(|gps| self.annotate(ping.device_id(), gps));
        let device = DeviceKey::new(ping.provider_id(), ping.device_id());

        let trip_id = match &ping {
            Ping::Event(event) => self.record_event(&device, event, &annotation).await?,
            Ping::Telemetry(telemetry) => {
                self.record_telemetry(&device, telemetry, &annotation).await?
            }
        };

        let next = derive_state(&ping, trip_id.clone(), annotation, current.as_ref());

        let disposition = if ping.event_type() == Some(EventType::Decommissioned) {
            self.decommission(&next, current.as_ref()).await?
        } else {
            match self.devices.put(&next).await? {
                PutOutcome::Accepted => Disposition::Applied,
                PutOutcome::Stale => {
                    log::debug!(
                        "Stale {} ping for {} at {}, state not updated",
                        ping.kind().as_str(),
                        ping.device_id(),
                        ping.timestamp()
                    );
                    Disposition::Stale
                }
            }
        };

        let side_effects = self.run_side_effects(&next, disposition).await;

        Ok(IngestOutcome {
            disposition,
            trip_id,
            side_effects: Some(side_effects),
        })
    }

    fn annotate(&self, device_id: &str, gps: &Gps) -> Option<GeoAnnotation> {
        match self.geography.annotate(gps) {
            Ok(annotation) => Some(annotation),
            Err(e) => {
                log::warn!("⚠️  Geography lookup failed for {}: {}", device_id, e);
                None
            }
        }
    }

    /// Append a boundary event and its fix. Returns the event's trip id.
    async fn record_event(
        &self,
        device: &DeviceKey,
        event: &EventPing,
        annotation: &Option<GeoAnnotation>,
    ) -> Result<Option<String>> {
        let (Some(boundary), Some(trip_id), Some(gps)) =
            (event.event_type.boundary(), &event.trip_id, &event.gps)
        else {
            return Ok(event.trip_id.clone());
        };

        let boundary_event = TripBoundaryEvent {
            timestamp: event.timestamp,
            boundary,
            event_type: event.event_type,
            reason: event.event_type_reason.clone(),
            district: annotation.as_ref().and_then(|a| a.district()).map(str::to_string),
            gps: *gps,
        };

        if !self.trips.append(device, trip_id, boundary_event).await? {
            log::debug!(
                "Boundary {} for trip {} of {} already recorded",
                event.event_type.as_str(),
                trip_id,
                device
            );
        }

        let point = TelemetryPoint::from_gps(event.timestamp, gps, annotation.clone());
        self.telemetry.append(device, trip_id, &point).await?;

        Ok(Some(trip_id.clone()))
    }

    /// Buffer telemetry for the trip it belongs to. Returns the matched trip.
    async fn record_telemetry(
        &self,
        device: &DeviceKey,
        telemetry: &TelemetryPing,
        annotation: &Option<GeoAnnotation>,
    ) -> Result<Option<String>> {
        let Some(matched) = self.trips.match_trip(device, telemetry.timestamp).await? else {
            log::debug!(
                "Telemetry for {} at {} precedes any trip start",
                device,
                telemetry.timestamp
            );
            return Ok(None);
        };

        if !matched.competing.is_empty() {
            log::warn!(
                "⚠️  {} has {} trips open at {}: using {}, also open {:?}",
                device,
                matched.competing.len() + 1,
                telemetry.timestamp,
                matched.trip_id,
                matched.competing
            );
        }

        // Points after the trip's end never land in a segment
        if !matched.open {
            return Ok(None);
        }

        let point =
            TelemetryPoint::from_gps(telemetry.timestamp, &telemetry.gps, annotation.clone());
        if !self.telemetry.append(device, &matched.trip_id, &point).await? {
            log::debug!(
                "Telemetry for trip {} of {} at {} already buffered",
                matched.trip_id,
                device,
                telemetry.timestamp
            );
        }

        Ok(Some(matched.trip_id))
    }

    async fn decommission(
        &self,
        next: &DeviceState,
        current: Option<&DeviceState>,
    ) -> Result<Disposition> {
        if current.is_some_and(|c| !supersedes(next, c)) {
            log::debug!(
                "Stale decommission for {} at {}, ignoring",
                next.device_id,
                next.timestamp
            );
            return Ok(Disposition::Stale);
        }

        self.devices.delete(&next.device_id).await?;
        log::info!("🗑️  Device {} decommissioned", next.device_id);
        Ok(Disposition::Decommissioned)
    }

    async fn run_side_effects(
        &self,
        state: &DeviceState,
        disposition: Disposition,
    ) -> SideEffectReport {
        let audit = async {
            match self.sink.insert(SinkRecord::DeviceState(state.clone())).await {
                Err(PipelineError::Conflict(_)) => Ok(()),
                other => other,
            }
        };

        let payload = serde_json::json!({
            "device_id": state.device_id,
            "provider_id": state.provider_id,
            "timestamp": state.timestamp,
            "ping_kind": state.ping_kind.as_str(),
            "vehicle_state": state.vehicle_state.as_str(),
            "trip_id": state.trip_id,
            "disposition": disposition.as_str(),
        });
        let publish = self.publisher.publish(DEVICE_PROCESSED, payload);

        let (audit, publish) = tokio::join!(
            bounded("insert device_states", self.side_effect_timeout, audit),
            bounded("publish device.processed", self.side_effect_timeout, publish),
        );

        if let Err(e) = &audit {
            log::warn!("⚠️  Audit write failed for {}: {}", state.device_id, e);
        }
        if let Err(e) = &publish {
            log::warn!("⚠️  Publish failed for {}: {}", state.device_id, e);
        }

        SideEffectReport { audit, publish }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::cache::InMemoryCache;
    use crate::pipeline::geography::NoGeography;
    use crate::pipeline::notify::LogPublisher;
    use crate::pipeline::types::VehicleState;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records inserts; optionally fails or hangs
    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<SinkRecord>>,
        fail: bool,
        hang: bool,
    }

    #[async_trait]
    impl PersistenceSink for RecordingSink {
        async fn insert(&self, record: SinkRecord) -> Result<()> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.fail {
                return Err(PipelineError::TransientStore("sink down".to_string()));
            }
            self.records.lock().unwrap().push(record);
            Ok(())
        }
    }

    async fn ingestor_with(sink: Arc<RecordingSink>) -> EventIngestor {
        let cache = Arc::new(InMemoryCache::new());
        cache.initialize().await.unwrap();
        EventIngestor::new(
            cache,
            sink,
            Arc::new(LogPublisher),
            Arc::new(NoGeography),
            Duration::from_millis(50),
        )
    }

    fn event(ts: i64, event_type: EventType, trip_id: Option<&str>) -> Ping {
        Ping::Event(EventPing {
            device_id: "dev-1".to_string(),
            provider_id: "prov-1".to_string(),
            timestamp: ts,
            event_type,
            event_type_reason: None,
            trip_id: trip_id.map(str::to_string),
            gps: Some(Gps::new(34.0, -118.0)),
            battery: Some(0.8),
            service_area_id: None,
            recorded: None,
        })
    }

    fn telemetry(ts: i64) -> Ping {
        Ping::Telemetry(TelemetryPing {
            device_id: "dev-1".to_string(),
            provider_id: "prov-1".to_string(),
            timestamp: ts,
            gps: Gps::new(34.001, -118.0),
            battery: None,
            recorded: None,
        })
    }

    #[tokio::test]
    async fn test_duplicate_ping_is_noop() {
        let sink = Arc::new(RecordingSink::default());
        let ingestor = ingestor_with(sink.clone()).await;

        let first = ingestor.ingest(event(1000, EventType::ServiceStart, None)).await.unwrap();
        let second = ingestor.ingest(event(1000, EventType::ServiceStart, None)).await.unwrap();

        assert_eq!(first.disposition, Disposition::Applied);
        assert_eq!(second.disposition, Disposition::Duplicate);
        assert!(second.side_effects.is_none());
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_trip_start_records_boundary_and_fix() {
        let ingestor = ingestor_with(Arc::new(RecordingSink::default())).await;
        let outcome = ingestor.ingest(event(1000, EventType::TripStart, Some("t1"))).await.unwrap();

        assert_eq!(outcome.trip_id.as_deref(), Some("t1"));
        let device = DeviceKey::new("prov-1", "dev-1");
        let events = ingestor.trip_log().trip_events(&device, "t1").await.unwrap().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(ingestor.telemetry().load(&device, "t1").await.unwrap().len(), 1);

        let state = ingestor.devices().get("dev-1").await.unwrap().unwrap();
        assert_eq!(state.vehicle_state, VehicleState::Trip);
    }

    #[tokio::test]
    async fn test_telemetry_matched_to_open_trip() {
        let ingestor = ingestor_with(Arc::new(RecordingSink::default())).await;
        ingestor.ingest(event(1000, EventType::TripStart, Some("t1"))).await.unwrap();

        let outcome = ingestor.ingest(telemetry(2000)).await.unwrap();
        assert_eq!(outcome.trip_id.as_deref(), Some("t1"));

        let device = DeviceKey::new("prov-1", "dev-1");
        let buffered: Vec<i64> = ingestor
            .telemetry()
            .load(&device, "t1")
            .await
            .unwrap()
            .iter()
            .map(|p| p.timestamp)
            .collect();
        assert_eq!(buffered, vec![1000, 2000]);
    }

    #[tokio::test]
    async fn test_telemetry_before_trip_not_buffered() {
        let ingestor = ingestor_with(Arc::new(RecordingSink::default())).await;
        let outcome = ingestor.ingest(telemetry(500)).await.unwrap();

        assert_eq!(outcome.trip_id, None);
        assert_eq!(outcome.disposition, Disposition::Applied);
        assert!(ingestor.trip_log().devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_late_ping_is_stale_but_keeps_trip_log() {
        let ingestor = ingestor_with(Arc::new(RecordingSink::default())).await;
        ingestor.ingest(telemetry(5000)).await.unwrap();

        let outcome = ingestor.ingest(event(1000, EventType::TripStart, Some("t1"))).await.unwrap();
        assert_eq!(outcome.disposition, Disposition::Stale);
        assert_eq!(ingestor.devices().get("dev-1").await.unwrap().unwrap().timestamp, 5000);

        let device = DeviceKey::new("prov-1", "dev-1");
        assert!(ingestor.trip_log().trip_events(&device, "t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_decommission_removes_state() {
        let ingestor = ingestor_with(Arc::new(RecordingSink::default())).await;
        ingestor.ingest(event(1000, EventType::ServiceStart, None)).await.unwrap();

        let stale = ingestor.ingest(event(500, EventType::Decommissioned, None)).await.unwrap();
        assert_eq!(stale.disposition, Disposition::Stale);
        assert!(ingestor.devices().get("dev-1").await.unwrap().is_some());

        let outcome = ingestor.ingest(event(2000, EventType::Decommissioned, None)).await.unwrap();
        assert_eq!(outcome.disposition, Disposition::Decommissioned);
        assert!(ingestor.devices().get("dev-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_fail_ingestion() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let ingestor = ingestor_with(sink).await;

        let outcome = ingestor.ingest(event(1000, EventType::ServiceStart, None)).await.unwrap();
        let report = outcome.side_effects.unwrap();
        assert!(matches!(report.audit, Err(PipelineError::TransientStore(_))));
        assert!(report.publish.is_ok());
        assert_eq!(outcome.disposition, Disposition::Applied);
    }

    #[tokio::test]
    async fn test_hung_sink_times_out() {
        let sink = Arc::new(RecordingSink {
            hang: true,
            ..Default::default()
        });
        let ingestor = ingestor_with(sink).await;

        let outcome = ingestor.ingest(event(1000, EventType::ServiceStart, None)).await.unwrap();
        let report = outcome.side_effects.unwrap();
        assert!(matches!(report.audit, Err(PipelineError::Timeout { .. })));
        assert!(!report.all_ok());
    }

    #[tokio::test]
    async fn test_cache_outage_propagates() {
        let cache = Arc::new(InMemoryCache::new());
        let ingestor = EventIngestor::new(
            cache,
            Arc::new(RecordingSink::default()),
            Arc::new(LogPublisher),
            Arc::new(NoGeography),
            Duration::from_millis(50),
        );

        let err = ingestor.ingest(telemetry(1000)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_invalid_json_is_validation_error() {
        let ingestor = ingestor_with(Arc::new(RecordingSink::default())).await;
        let err = ingestor.ingest_json("{not json").await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}
