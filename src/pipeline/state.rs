//! Vehicle state machine and device-state ordering rules
//!
//! Every event type maps to a vehicle state; the event type itself is kept as
//! the sub-state. Telemetry never changes the vehicle state, it only refreshes
//! position, battery and timestamp.

use super::types::{DeviceState, EventType, GeoAnnotation, Ping, PingKind, VehicleState};

impl EventType {
    /// Vehicle state a device enters after this event
    pub fn vehicle_state(&self) -> VehicleState {
        match self {
            EventType::Register => VehicleState::Removed,
            EventType::ServiceStart => VehicleState::Available,
            EventType::ServiceEnd => VehicleState::Unavailable,
            EventType::ProviderDropOff => VehicleState::Available,
            EventType::ProviderPickUp => VehicleState::Removed,
            EventType::CityPickUp => VehicleState::Removed,
            EventType::Reserve => VehicleState::Reserved,
            EventType::CancelReservation => VehicleState::Available,
            EventType::TripStart => VehicleState::Trip,
            EventType::TripEnter => VehicleState::Trip,
            EventType::TripLeave => VehicleState::Elsewhere,
            EventType::TripEnd => VehicleState::Available,
            EventType::Deregister => VehicleState::Inactive,
            EventType::Decommissioned => VehicleState::Inactive,
            EventType::Unknown => VehicleState::Unknown,
        }
    }
}

/// Exact redelivery of the ping that produced `current`.
///
/// Identity is (timestamp, ping kind, sub-state). Telemetry has no sub-state
/// of its own, so for telemetry the first two suffice.
pub fn is_duplicate(current: &DeviceState, ping: &Ping) -> bool {
    if current.timestamp != ping.timestamp() || current.ping_kind != ping.kind() {
        return false;
    }

    match ping {
        Ping::Event(event) => current.sub_state == Some(event.event_type),
        Ping::Telemetry(_) => true,
    }
}

/// Whether `incoming` may replace `current` in the device state store.
///
/// Newer timestamps always win, older ones never do. On a tie, a telemetry
/// ping never displaces an event. Telemetry sharing a timestamp with a trip
/// boundary belongs to that trip even when the event already moved the
/// device off-trip, so the rule cannot depend on the derived trip id.
pub fn supersedes(incoming: &DeviceState, current: &DeviceState) -> bool {
    if incoming.timestamp != current.timestamp {
        return incoming.timestamp > current.timestamp;
    }

    !(incoming.ping_kind == PingKind::Telemetry && current.ping_kind == PingKind::Event)
}

/// Build the next state for a device from a validated ping.
///
/// `trip_id` is the trip the ping belongs to: the event's own trip, or the
/// trip a telemetry ping was matched to.
pub fn derive_state(
    ping: &Ping,
    trip_id: Option<String>,
    annotation: Option<GeoAnnotation>,
    previous: Option<&DeviceState>,
) -> DeviceState {
    let (vehicle_state, sub_state, service_area_id) = match ping {
        Ping::Event(event) => (
            event.event_type.vehicle_state(),
            Some(event.event_type),
            event.service_area_id.clone(),
        ),
        Ping::Telemetry(_) => (
            previous.map_or(VehicleState::Unknown, |p| p.vehicle_state),
            previous.and_then(|p| p.sub_state),
            previous.and_then(|p| p.service_area_id.clone()),
        ),
    };

    // Only on-trip devices keep a trip id; an explicit trip wins over the
    // one carried forward.
    let trip_id = match vehicle_state {
        VehicleState::Trip | VehicleState::Elsewhere => {
            trip_id.or_else(|| previous.and_then(|p| p.trip_id.clone()))
        }
        _ if ping.kind() == PingKind::Event => trip_id,
        _ => None,
    };

    let battery = ping.battery().or_else(|| previous.and_then(|p| p.battery));

    DeviceState {
        device_id: ping.device_id().to_string(),
        provider_id: ping.provider_id().to_string(),
        ping_kind: ping.kind(),
        timestamp: ping.timestamp(),
        vehicle_state,
        sub_state,
        trip_id,
        gps: ping.gps().copied(),
        battery,
        annotation,
        service_area_id,
        recorded: ping.recorded(),
        prev_state: previous.map(DeviceState::snapshot),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{EventPing, Gps, TelemetryPing};

    fn event(ts: i64, event_type: EventType, trip_id: Option<&str>) -> Ping {
        Ping::Event(EventPing {
            device_id: "dev-1".to_string(),
            provider_id: "prov-1".to_string(),
            timestamp: ts,
            event_type,
            event_type_reason: None,
            trip_id: trip_id.map(str::to_string),
            gps: Some(Gps::new(34.0, -118.0)),
            battery: Some(0.9),
            service_area_id: None,
            recorded: None,
        })
    }

    fn telemetry(ts: i64) -> Ping {
        Ping::Telemetry(TelemetryPing {
            device_id: "dev-1".to_string(),
            provider_id: "prov-1".to_string(),
            timestamp: ts,
            gps: Gps::new(34.001, -118.001),
            battery: None,
            recorded: None,
        })
    }

    #[test]
    fn test_trip_start_enters_trip_state() {
        let ping = event(1000, EventType::TripStart, Some("t1"));
        let state = derive_state(&ping, Some("t1".into()), None, None);
        assert_eq!(state.vehicle_state, VehicleState::Trip);
        assert_eq!(state.sub_state, Some(EventType::TripStart));
        assert_eq!(state.trip_id.as_deref(), Some("t1"));
        assert!(state.prev_state.is_none());
    }

    #[test]
    fn test_telemetry_carries_state_forward() {
        let ping = event(1000, EventType::TripStart, Some("t1"));
        let start = derive_state(&ping, Some("t1".into()), None, None);
        let next = derive_state(&telemetry(2000), None, None, Some(&start));

        assert_eq!(next.vehicle_state, VehicleState::Trip);
        assert_eq!(next.sub_state, Some(EventType::TripStart));
        assert_eq!(next.trip_id.as_deref(), Some("t1"));
        assert_eq!(next.battery, Some(0.9));
        assert_eq!(next.prev_state.as_ref().map(|p| p.timestamp), Some(1000));
    }

    #[test]
    fn test_telemetry_off_trip_has_no_trip_id() {
        let ping = event(1000, EventType::TripEnd, Some("t1"));
        let end = derive_state(&ping, Some("t1".into()), None, None);
        let next = derive_state(&telemetry(2000), None, None, Some(&end));
        assert_eq!(next.vehicle_state, VehicleState::Available);
        assert_eq!(next.trip_id, None);
    }

    #[test]
    fn test_duplicate_detection() {
        let ping = event(1000, EventType::TripEnd, Some("t1"));
        let state = derive_state(&ping, Some("t1".into()), None, None);

        assert!(is_duplicate(&state, &ping));
        assert!(!is_duplicate(&state, &event(1000, EventType::ServiceEnd, None)));
        assert!(!is_duplicate(&state, &event(1001, EventType::TripEnd, Some("t1"))));
        assert!(!is_duplicate(&state, &telemetry(1000)));
    }

    #[test]
    fn test_older_ping_never_supersedes() {
        let current = derive_state(&telemetry(2000), None, None, None);
        let older = derive_state(&event(1000, EventType::ServiceStart, None), None, None, None);
        assert!(!supersedes(&older, &current));
        assert!(supersedes(&current, &older));
    }

    #[test]
    fn test_tie_favors_event_with_same_trip() {
        let ping = event(1000, EventType::TripStart, Some("t1"));
        let event_state = derive_state(&ping, Some("t1".into()), None, None);
        let telemetry_state =
            derive_state(&telemetry(1000), Some("t1".into()), None, Some(&event_state));

        assert!(!supersedes(&telemetry_state, &event_state));
        assert!(supersedes(&event_state, &telemetry_state));
    }

    #[test]
    fn test_tie_at_trip_end_favors_event() {
        let start = derive_state(
            &event(1000, EventType::TripStart, Some("t1")),
            Some("t1".into()),
            None,
            None,
        );
        let end = derive_state(
            &event(2000, EventType::TripEnd, Some("t1")),
            Some("t1".into()),
            None,
            Some(&start),
        );
        // Matched to t1, but the device is already off-trip so no trip id survives
        let telemetry_state = derive_state(&telemetry(2000), Some("t1".into()), None, Some(&end));
        assert_eq!(telemetry_state.trip_id, None);

        assert!(!supersedes(&telemetry_state, &end));
        assert!(supersedes(&end, &telemetry_state));
    }

    #[test]
    fn test_tie_between_telemetry_pings_accepts_incoming() {
        let first = derive_state(&telemetry(1000), None, None, None);
        let second = derive_state(&telemetry(1000), None, None, Some(&first));
        assert!(supersedes(&second, &first));
    }
}
