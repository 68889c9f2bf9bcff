//! Core data types: inbound ping envelope, normalized pings, device state,
//! trip boundary events, telemetry points and completed trips.
//!
//! All timestamps are Unix epoch milliseconds.

use super::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};

/// Unix epoch milliseconds
pub type Timestamp = i64;

/// Latest accepted ping timestamp, 9999-12-31T23:59:59.999Z
pub const MAX_TIMESTAMP_MS: Timestamp = 253_402_300_799_999;

/// A GPS fix as reported by a provider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gps {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satellites: Option<u32>,
}

impl Gps {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            speed: None,
            heading: None,
            accuracy: None,
            altitude: None,
            satellites: None,
        }
    }

    /// Reject coordinates outside the WGS84 range (and NaN).
    pub fn validate(&self) -> Result<()> {
        if !(-90.0..=90.0).contains(&self.lat) || !(-180.0..=180.0).contains(&self.lng) {
            return Err(PipelineError::Validation(format!(
                "gps out of range: lat={}, lng={}",
                self.lat, self.lng
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PingKind {
    Event,
    Telemetry,
}

impl PingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PingKind::Event => "event",
            PingKind::Telemetry => "telemetry",
        }
    }
}

/// Vehicle event vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Register,
    ServiceStart,
    ServiceEnd,
    ProviderDropOff,
    ProviderPickUp,
    CityPickUp,
    Reserve,
    CancelReservation,
    TripStart,
    TripEnter,
    TripLeave,
    TripEnd,
    Deregister,
    Decommissioned,
    Unknown,
}

impl EventType {
    /// Parse a provider-supplied event type. Unrecognized values map to
    /// `Unknown` rather than failing the ping.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "register" => EventType::Register,
            "service_start" => EventType::ServiceStart,
            "service_end" => EventType::ServiceEnd,
            "provider_drop_off" => EventType::ProviderDropOff,
            "provider_pick_up" => EventType::ProviderPickUp,
            "city_pick_up" => EventType::CityPickUp,
            "reserve" | "reservation_start" => EventType::Reserve,
            "cancel_reservation" | "reservation_cancel" => EventType::CancelReservation,
            "trip_start" => EventType::TripStart,
            "trip_enter" | "trip_enter_jurisdiction" => EventType::TripEnter,
            "trip_leave" | "trip_leave_jurisdiction" => EventType::TripLeave,
            "trip_end" => EventType::TripEnd,
            "deregister" => EventType::Deregister,
            "decommissioned" => EventType::Decommissioned,
            _ => EventType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Register => "register",
            EventType::ServiceStart => "service_start",
            EventType::ServiceEnd => "service_end",
            EventType::ProviderDropOff => "provider_drop_off",
            EventType::ProviderPickUp => "provider_pick_up",
            EventType::CityPickUp => "city_pick_up",
            EventType::Reserve => "reserve",
            EventType::CancelReservation => "cancel_reservation",
            EventType::TripStart => "trip_start",
            EventType::TripEnter => "trip_enter",
            EventType::TripLeave => "trip_leave",
            EventType::TripEnd => "trip_end",
            EventType::Deregister => "deregister",
            EventType::Decommissioned => "decommissioned",
            EventType::Unknown => "unknown",
        }
    }

    /// Boundary type when this event starts, enters, leaves or ends a trip
    pub fn boundary(&self) -> Option<BoundaryType> {
        match self {
            EventType::TripStart => Some(BoundaryType::Start),
            EventType::TripEnter => Some(BoundaryType::Enter),
            EventType::TripLeave => Some(BoundaryType::Leave),
            EventType::TripEnd => Some(BoundaryType::End),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryType {
    Start,
    Enter,
    Leave,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleState {
    Available,
    Unavailable,
    Reserved,
    Trip,
    Elsewhere,
    Removed,
    Inactive,
    Unknown,
}

impl VehicleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleState::Available => "available",
            VehicleState::Unavailable => "unavailable",
            VehicleState::Reserved => "reserved",
            VehicleState::Trip => "trip",
            VehicleState::Elsewhere => "elsewhere",
            VehicleState::Removed => "removed",
            VehicleState::Inactive => "inactive",
            VehicleState::Unknown => "unknown",
        }
    }
}

/// Geofence membership for a point, as resolved by the geography capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoAnnotation {
    /// Geography (district / service area) ids containing the point
    pub geography_ids: Vec<String>,
    /// True when the point falls inside at least one known geography
    pub in_bound: bool,
    /// Annotation schema version
    pub version: String,
}

impl GeoAnnotation {
    /// Primary district for the point, if any
    pub fn district(&self) -> Option<&str> {
        self.geography_ids.first().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Inbound wire format
// ---------------------------------------------------------------------------

/// Inbound message as delivered by the transport.
///
/// The `type` suffix (`...event` / `...telemetry`) selects the ping kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPing {
    #[serde(rename = "type")]
    pub ping_type: String,
    pub data: RawPingData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPingData {
    pub device_id: String,
    pub provider_id: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub event_type_reason: Option<String>,
    #[serde(default)]
    pub trip_id: Option<String>,
    /// Telemetry pings carry gps at the top level
    #[serde(default)]
    pub gps: Option<Gps>,
    /// Event pings nest gps and charge under `telemetry`
    #[serde(default)]
    pub telemetry: Option<RawTelemetry>,
    #[serde(default)]
    pub charge: Option<f64>,
    #[serde(default)]
    pub service_area_id: Option<String>,
    #[serde(default)]
    pub recorded: Option<Timestamp>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTelemetry {
    #[serde(default)]
    pub gps: Option<Gps>,
    #[serde(default)]
    pub charge: Option<f64>,
}

// ---------------------------------------------------------------------------
// Normalized pings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPing {
    pub device_id: String,
    pub provider_id: String,
    pub timestamp: Timestamp,
    pub event_type: EventType,
    pub event_type_reason: Option<String>,
    pub trip_id: Option<String>,
    pub gps: Option<Gps>,
    pub battery: Option<f64>,
    pub service_area_id: Option<String>,
    pub recorded: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPing {
    pub device_id: String,
    pub provider_id: String,
    pub timestamp: Timestamp,
    pub gps: Gps,
    pub battery: Option<f64>,
    pub recorded: Option<Timestamp>,
}

/// One inbound event or telemetry message for a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ping {
    Event(EventPing),
    Telemetry(TelemetryPing),
}

impl Ping {
    /// Parse and validate a JSON-encoded [`RawPing`].
    pub fn from_json(payload: &str) -> Result<Self> {
        let raw: RawPing = serde_json::from_str(payload)?;
        Ping::try_from(raw)
    }

    pub fn kind(&self) -> PingKind {
        match self {
            Ping::Event(_) => PingKind::Event,
            Ping::Telemetry(_) => PingKind::Telemetry,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            Ping::Event(e) => &e.device_id,
            Ping::Telemetry(t) => &t.device_id,
        }
    }

    pub fn provider_id(&self) -> &str {
        match self {
            Ping::Event(e) => &e.provider_id,
            Ping::Telemetry(t) => &t.provider_id,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            Ping::Event(e) => e.timestamp,
            Ping::Telemetry(t) => t.timestamp,
        }
    }

    pub fn gps(&self) -> Option<&Gps> {
        match self {
            Ping::Event(e) => e.gps.as_ref(),
            Ping::Telemetry(t) => Some(&t.gps),
        }
    }

    pub fn battery(&self) -> Option<f64> {
        match self {
            Ping::Event(e) => e.battery,
            Ping::Telemetry(t) => t.battery,
        }
    }

    pub fn recorded(&self) -> Option<Timestamp> {
        match self {
            Ping::Event(e) => e.recorded,
            Ping::Telemetry(t) => t.recorded,
        }
    }

    /// Event type for events; telemetry has none of its own
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            Ping::Event(e) => Some(e.event_type),
            Ping::Telemetry(_) => None,
        }
    }
}

impl TryFrom<RawPing> for Ping {
    type Error = PipelineError;

    fn try_from(raw: RawPing) -> Result<Self> {
        let kind = if raw.ping_type.ends_with("telemetry") {
            PingKind::Telemetry
        } else if raw.ping_type.ends_with("event") {
            PingKind::Event
        } else {
            return Err(PipelineError::Validation(format!(
                "unrecognized ping type '{}'",
                raw.ping_type
            )));
        };

        let data = raw.data;
        if data.device_id.trim().is_empty() {
            return Err(PipelineError::Validation("missing device_id".to_string()));
        }
        if data.provider_id.trim().is_empty() {
            return Err(PipelineError::Validation("missing provider_id".to_string()));
        }
        if data.timestamp <= 0 {
            return Err(PipelineError::Validation(format!(
                "non-positive timestamp {} for device {}",
                data.timestamp, data.device_id
            )));
        }
        if data.timestamp > MAX_TIMESTAMP_MS {
            return Err(PipelineError::Validation(format!(
                "timestamp {} for device {} is past year 9999",
                data.timestamp, data.device_id
            )));
        }

        // Telemetry pings put gps/charge at the top level, events nest them
        let nested = data.telemetry.unwrap_or_default();
        let gps = data.gps.or(nested.gps);
        let battery = data.charge.or(nested.charge);
        if let Some(gps) = &gps {
            gps.validate()?;
        }

        match kind {
            PingKind::Telemetry => {
                let gps = gps.ok_or_else(|| {
                    PipelineError::Validation(format!(
                        "telemetry for device {} has no gps",
                        data.device_id
                    ))
                })?;
                Ok(Ping::Telemetry(TelemetryPing {
                    device_id: data.device_id,
                    provider_id: data.provider_id,
                    timestamp: data.timestamp,
                    gps,
                    battery,
                    recorded: data.recorded,
                }))
            }
            PingKind::Event => {
                let event_type = data
                    .event_type
                    .as_deref()
                    .map(EventType::from_wire)
                    .ok_or_else(|| {
                        PipelineError::Validation(format!(
                            "event for device {} has no event_type",
                            data.device_id
                        ))
                    })?;

                if event_type.boundary().is_some() {
                    if data.trip_id.as_deref().map_or(true, |t| t.trim().is_empty()) {
                        return Err(PipelineError::Validation(format!(
                            "{} for device {} has no trip_id",
                            event_type.as_str(),
                            data.device_id
                        )));
                    }
                    if gps.is_none() {
                        return Err(PipelineError::Validation(format!(
                            "{} for device {} has no gps",
                            event_type.as_str(),
                            data.device_id
                        )));
                    }
                }

                Ok(Ping::Event(EventPing {
                    device_id: data.device_id,
                    provider_id: data.provider_id,
                    timestamp: data.timestamp,
                    event_type,
                    event_type_reason: data.event_type_reason,
                    trip_id: data.trip_id,
                    gps,
                    battery,
                    service_area_id: data.service_area_id,
                    recorded: data.recorded,
                }))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Device state
// ---------------------------------------------------------------------------

/// Snapshot of the state a device held before its latest accepted ping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrevState {
    pub ping_kind: PingKind,
    pub timestamp: Timestamp,
    pub vehicle_state: VehicleState,
    pub sub_state: Option<EventType>,
    pub trip_id: Option<String>,
}

/// Latest known state for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: String,
    pub provider_id: String,
    pub ping_kind: PingKind,
    pub timestamp: Timestamp,
    pub vehicle_state: VehicleState,
    /// Last event type seen; carried forward across telemetry
    pub sub_state: Option<EventType>,
    pub trip_id: Option<String>,
    pub gps: Option<Gps>,
    pub battery: Option<f64>,
    pub annotation: Option<GeoAnnotation>,
    pub service_area_id: Option<String>,
    pub recorded: Option<Timestamp>,
    pub prev_state: Option<PrevState>,
}

impl DeviceState {
    pub fn snapshot(&self) -> PrevState {
        PrevState {
            ping_kind: self.ping_kind,
            timestamp: self.timestamp,
            vehicle_state: self.vehicle_state,
            sub_state: self.sub_state,
            trip_id: self.trip_id.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Trips
// ---------------------------------------------------------------------------

/// An event marking the start, jurisdiction entry/exit, or end of a trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripBoundaryEvent {
    pub timestamp: Timestamp,
    pub boundary: BoundaryType,
    pub event_type: EventType,
    pub reason: Option<String>,
    pub district: Option<String>,
    pub gps: Gps,
}

/// Raw telemetry point buffered for a trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub timestamp: Timestamp,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub annotation: Option<GeoAnnotation>,
}

impl TelemetryPoint {
    pub fn from_gps(timestamp: Timestamp, gps: &Gps, annotation: Option<GeoAnnotation>) -> Self {
        Self {
            timestamp,
            lat: gps.lat,
            lng: gps.lng,
            annotation,
        }
    }
}

/// Telemetry between two consecutive boundary events (both inclusive)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripSegment {
    pub start_timestamp: Timestamp,
    pub end_timestamp: Timestamp,
    pub points: Vec<TelemetryPoint>,
}

/// A finalized trip, written once to the `trips` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedTrip {
    pub provider_id: String,
    pub device_id: String,
    pub trip_id: String,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub start_district: Option<String>,
    pub end_district: Option<String>,
    pub duration_ms: i64,
    pub distance_m: f64,
    pub violation_count: u32,
    pub min_violation_m: Option<f64>,
    pub max_violation_m: Option<f64>,
    pub avg_violation_m: Option<f64>,
    pub segments: Vec<TripSegment>,
}
