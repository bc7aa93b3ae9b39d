//! Domain events and the telemetry wire codec
//!
//! The serde field names define the wire format; the serialized JSON is what
//! the hub ingests, so renames here are wire-breaking.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Current UTC time as ISO-8601 with millisecond precision and `Z` suffix
pub fn utc_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Tracker event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Heartbeat,
    IgnitionOn,
    IgnitionOff,
    MotionStart,
    MotionStop,
    GeofenceEnter,
    GeofenceExit,
    SpeedOverLimit,
    LowBattery,
}

impl EventType {
    /// Every event type, for bulk subscription
    pub const ALL: [EventType; 9] = [
        EventType::Heartbeat,
        EventType::IgnitionOn,
        EventType::IgnitionOff,
        EventType::MotionStart,
        EventType::MotionStop,
        EventType::GeofenceEnter,
        EventType::GeofenceExit,
        EventType::SpeedOverLimit,
        EventType::LowBattery,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Heartbeat => "heartbeat",
            EventType::IgnitionOn => "ignition_on",
            EventType::IgnitionOff => "ignition_off",
            EventType::MotionStart => "motion_start",
            EventType::MotionStop => "motion_stop",
            EventType::GeofenceEnter => "geofence_enter",
            EventType::GeofenceExit => "geofence_exit",
            EventType::SpeedOverLimit => "speed_over_limit",
            EventType::LowBattery => "low_battery",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GPS fix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    #[serde(rename = "acc")]
    pub accuracy: f64,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
            accuracy: 0.0,
        }
    }
}

/// Battery state as reported on the wire; percentage is integral there
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub pct: u8,
    pub voltage: f64,
}

impl Default for BatteryStatus {
    fn default() -> Self {
        Self {
            pct: 100,
            voltage: 4.0,
        }
    }
}

/// Cellular link state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub rssi: i32,
    pub rat: String,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self {
            rssi: -70,
            rat: "LTE".to_string(),
        }
    }
}

/// One telemetry event.
///
/// Immutable once constructed; the sequence number is strictly monotonic per
/// device across the process lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "ts")]
    pub timestamp: String,
    #[serde(rename = "eventType")]
    pub event_type: EventType,
    #[serde(rename = "seq")]
    pub sequence: u64,
    #[serde(rename = "loc")]
    pub location: Location,
    #[serde(rename = "speedKph")]
    pub speed_kph: f64,
    pub heading: f64,
    pub battery: BatteryStatus,
    pub network: NetworkStatus,
    /// Free-form string pairs; empty values travel as JSON null and the
    /// whole field is omitted when empty
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, Option<String>>,
}

impl Event {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Live telemetry values stamped onto every event
#[derive(Debug, Clone, Default)]
pub struct TelemetrySnapshot {
    pub location: Location,
    pub speed_kph: f64,
    pub heading: f64,
    pub battery: BatteryStatus,
    pub network: NetworkStatus,
}

/// Builds events with the shared device id and a strictly monotonic
/// sequence counter.
///
/// Shared between the state machine emissions and the pipeline heartbeat so
/// `seq` stays globally ordered.
pub struct EventFactory {
    device_id: RwLock<String>,
    sequence: AtomicU64,
}

impl EventFactory {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: RwLock::new(device_id.into()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Update the device id once provisioning assigns one
    pub fn set_device_id(&self, device_id: impl Into<String>) {
        *self.device_id.write().expect("device id lock poisoned") = device_id.into();
    }

    pub fn device_id(&self) -> String {
        self.device_id.read().expect("device id lock poisoned").clone()
    }

    /// Build the next event; each call consumes one sequence number
    pub fn create(&self, event_type: EventType, snapshot: &TelemetrySnapshot) -> Event {
        Event {
            device_id: self.device_id(),
            timestamp: utc_timestamp(),
            event_type,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            location: snapshot.location,
            speed_kph: snapshot.speed_kph,
            heading: snapshot.heading,
            battery: snapshot.battery,
            network: snapshot.network.clone(),
            extras: BTreeMap::new(),
        }
    }

    /// Build the next event with extras attached
    pub fn create_with_extras(
        &self,
        event_type: EventType,
        snapshot: &TelemetrySnapshot,
        extras: BTreeMap<String, Option<String>>,
    ) -> Event {
        let mut event = self.create(event_type, snapshot);
        event.extras = extras;
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            device_id: "123456789101112".to_string(),
            timestamp: "2025-08-02T10:15:30.123Z".to_string(),
            event_type: EventType::SpeedOverLimit,
            sequence: 42,
            location: Location {
                lat: -26.2041,
                lon: 28.0473,
                alt: 1720.0,
                accuracy: 12.5,
            },
            speed_kph: 97.5,
            heading: 182.0,
            battery: BatteryStatus {
                pct: 87,
                voltage: 4.05,
            },
            network: NetworkStatus {
                rssi: -72,
                rat: "LTE".to_string(),
            },
            extras: BTreeMap::from([
                ("limit".to_string(), Some("90".to_string())),
                ("note".to_string(), None),
            ]),
        }
    }

    #[test]
    fn test_wire_field_names() {
        let json: serde_json::Value =
            serde_json::from_str(&sample_event().to_json().unwrap()).unwrap();

        assert_eq!(json["deviceId"], "123456789101112");
        assert_eq!(json["ts"], "2025-08-02T10:15:30.123Z");
        assert_eq!(json["eventType"], "speed_over_limit");
        assert_eq!(json["seq"], 42);
        assert_eq!(json["loc"]["lat"], -26.2041);
        assert_eq!(json["loc"]["acc"], 12.5);
        assert_eq!(json["speedKph"], 97.5);
        assert_eq!(json["battery"]["pct"], 87);
        assert_eq!(json["network"]["rssi"], -72);
        assert_eq!(json["extras"]["limit"], "90");
        assert!(json["extras"]["note"].is_null());
    }

    #[test]
    fn test_round_trip() {
        let event = sample_event();
        let decoded = Event::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_empty_extras_omitted() {
        let mut event = sample_event();
        event.extras.clear();

        let json: serde_json::Value =
            serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert!(json.get("extras").is_none());

        // And deserializing without the field yields an empty map
        let decoded = Event::from_json(&event.to_json().unwrap()).unwrap();
        assert!(decoded.extras.is_empty());
    }

    #[test]
    fn test_event_type_strings() {
        for ty in EventType::ALL {
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
        }
    }

    #[test]
    fn test_factory_sequence_is_strictly_monotonic() {
        let factory = EventFactory::new("dev-1");
        let snapshot = TelemetrySnapshot::default();

        let mut last = 0;
        for _ in 0..100 {
            let event = factory.create(EventType::Heartbeat, &snapshot);
            assert!(event.sequence > last);
            last = event.sequence;
        }
    }

    #[test]
    fn test_factory_device_id_update() {
        let factory = EventFactory::new("SIM-001");
        factory.set_device_id("123456789101112");

        let event = factory.create(EventType::Heartbeat, &TelemetrySnapshot::default());
        assert_eq!(event.device_id, "123456789101112");
    }

    #[test]
    fn test_timestamp_format() {
        let ts = utc_timestamp();
        // YYYY-MM-DDTHH:MM:SS.mmmZ
        assert_eq!(ts.len(), 24);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[10..11], "T");
        assert_eq!(&ts[19..20], ".");
    }
}
