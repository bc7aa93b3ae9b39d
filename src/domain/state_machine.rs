//! Device state machine
//!
//! Closed transition table over `Idle / Driving / Parked / LowBattery /
//! Offline`. Wire events are emitted on input edges (an ignition toggle, a
//! motion change, the first downward battery crossing), so repeated inputs
//! at the same level stay silent. Geofence membership and the speed-limit
//! crossing are tracked here as well; both are edge-triggered.

use super::event::EventType;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Extras map attached to emitted events
pub type EventExtras = BTreeMap<String, Option<String>>;

/// Emission callback; the owner stamps full telemetry onto the event
pub type EventEmitter = Box<dyn Fn(EventType, EventExtras) + Send + Sync>;

/// Device operating states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Driving,
    Parked,
    LowBattery,
    Offline,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceState::Idle => "Idle",
            DeviceState::Driving => "Driving",
            DeviceState::Parked => "Parked",
            DeviceState::LowBattery => "LowBattery",
            DeviceState::Offline => "Offline",
        };
        f.write_str(name)
    }
}

/// Inputs driving the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceInput {
    IgnitionOn,
    IgnitionOff,
    MotionStart,
    MotionStop,
    BatteryLow,
    BatteryNormal,
    ConnectionLost,
    ConnectionRestored,
    ParkingTimerExpired,
}

/// How long a vehicle sits in `Parked` after motion stops before settling
/// back to `Idle`
const PARKING_TIMEOUT: Duration = Duration::from_secs(120);

pub struct DeviceStateMachine {
    state: DeviceState,
    ignition_on: bool,
    in_motion: bool,
    connected: bool,
    battery_pct: f64,
    low_battery_threshold: f64,
    over_speed_limit: bool,
    geofences_inside: Vec<String>,
    motion_stopped_at: Option<Instant>,
    emitter: Option<EventEmitter>,
}

impl DeviceStateMachine {
    pub fn new(low_battery_threshold: f64) -> Self {
        Self {
            state: DeviceState::Idle,
            ignition_on: false,
            in_motion: false,
            connected: true,
            battery_pct: 100.0,
            low_battery_threshold,
            over_speed_limit: false,
            geofences_inside: Vec::new(),
            motion_stopped_at: None,
            emitter: None,
        }
    }

    pub fn set_emitter(&mut self, emitter: impl Fn(EventType, EventExtras) + Send + Sync + 'static) {
        self.emitter = Some(Box::new(emitter));
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn ignition_on(&self) -> bool {
        self.ignition_on
    }

    pub fn in_motion(&self) -> bool {
        self.in_motion
    }

    /// Ignition input edge
    pub fn set_ignition(&mut self, on: bool) {
        if self.ignition_on == on {
            return;
        }
        self.ignition_on = on;
        self.emit(
            if on {
                EventType::IgnitionOn
            } else {
                EventType::IgnitionOff
            },
            EventExtras::new(),
        );
        self.apply(if on {
            DeviceInput::IgnitionOn
        } else {
            DeviceInput::IgnitionOff
        });
    }

    /// Motion input edge
    pub fn set_motion(&mut self, in_motion: bool) {
        if self.in_motion == in_motion {
            return;
        }
        self.in_motion = in_motion;
        self.emit(
            if in_motion {
                EventType::MotionStart
            } else {
                EventType::MotionStop
            },
            EventExtras::new(),
        );
        self.apply(if in_motion {
            DeviceInput::MotionStart
        } else {
            DeviceInput::MotionStop
        });
    }

    /// Battery level update; emits `low_battery` once per downward crossing
    pub fn set_battery_level(&mut self, percentage: f64) {
        let was_low = self.battery_pct < self.low_battery_threshold;
        self.battery_pct = percentage;
        let is_low = percentage < self.low_battery_threshold;

        if !was_low && is_low {
            self.emit(EventType::LowBattery, EventExtras::new());
            self.apply(DeviceInput::BatteryLow);
        } else if was_low && !is_low {
            self.apply(DeviceInput::BatteryNormal);
        }
    }

    /// Connectivity input edge
    pub fn set_connection(&mut self, connected: bool) {
        if self.connected == connected {
            return;
        }
        self.connected = connected;
        self.apply(if connected {
            DeviceInput::ConnectionRestored
        } else {
            DeviceInput::ConnectionLost
        });
    }

    /// Speed check; emits `speed_over_limit` only on the upward crossing
    pub fn check_speed(&mut self, speed_kph: f64, limit_kph: f64) {
        let over = speed_kph > limit_kph;
        if over && !self.over_speed_limit {
            self.emit(
                EventType::SpeedOverLimit,
                EventExtras::from([
                    ("limit".to_string(), Some(format!("{}", limit_kph as i64))),
                    ("measured".to_string(), Some(format!("{}", speed_kph as i64))),
                ]),
            );
        }
        self.over_speed_limit = over;
    }

    /// Diff the current geofence membership against the previous set,
    /// emitting enter/exit events per change
    pub fn update_geofences(&mut self, inside: &[String]) {
        for id in inside {
            if !self.geofences_inside.contains(id) {
                self.geofences_inside.push(id.clone());
                self.emit(
                    EventType::GeofenceEnter,
                    EventExtras::from([("geofenceId".to_string(), Some(id.clone()))]),
                );
            }
        }

        let mut exited = Vec::new();
        self.geofences_inside.retain(|id| {
            if inside.contains(id) {
                true
            } else {
                exited.push(id.clone());
                false
            }
        });
        for id in exited {
            self.emit(
                EventType::GeofenceExit,
                EventExtras::from([("geofenceId".to_string(), Some(id))]),
            );
        }
    }

    /// Advance time-driven transitions (the parking timer)
    pub fn process_timers(&mut self) {
        if self.state == DeviceState::Parked {
            if let Some(stopped_at) = self.motion_stopped_at {
                if stopped_at.elapsed() >= PARKING_TIMEOUT {
                    self.apply(DeviceInput::ParkingTimerExpired);
                }
            }
        }
    }

    fn apply(&mut self, input: DeviceInput) {
        use DeviceInput as I;
        use DeviceState as S;

        let next = match (self.state, input) {
            (S::Idle, I::IgnitionOn) => Some(S::Driving),
            (S::Idle, I::BatteryLow) => Some(S::LowBattery),
            (S::Idle, I::ConnectionLost) => Some(S::Offline),

            (S::Driving, I::IgnitionOff | I::MotionStop) => {
                self.motion_stopped_at = Some(Instant::now());
                Some(S::Parked)
            }
            (S::Driving, I::BatteryLow) => Some(S::LowBattery),
            (S::Driving, I::ConnectionLost) => Some(S::Offline),

            (S::Parked, I::IgnitionOn | I::MotionStart) => {
                self.motion_stopped_at = None;
                Some(S::Driving)
            }
            (S::Parked, I::ParkingTimerExpired) => {
                self.motion_stopped_at = None;
                Some(S::Idle)
            }
            (S::Parked, I::BatteryLow) => Some(S::LowBattery),
            (S::Parked, I::ConnectionLost) => Some(S::Offline),

            (S::LowBattery, I::BatteryNormal) => Some(if self.ignition_on {
                S::Driving
            } else {
                S::Idle
            }),
            (S::LowBattery, I::ConnectionLost) => Some(S::Offline),

            (S::Offline, I::ConnectionRestored) => {
                Some(if self.battery_pct < self.low_battery_threshold {
                    S::LowBattery
                } else if self.ignition_on && self.in_motion {
                    S::Driving
                } else if self.ignition_on || self.in_motion {
                    S::Parked
                } else {
                    S::Idle
                })
            }

            _ => None,
        };

        if let Some(next) = next {
            if next != self.state {
                debug!(from = %self.state, to = %next, "state transition");
                self.state = next;
            }
        }
    }

    fn emit(&self, event_type: EventType, extras: EventExtras) {
        if let Some(emitter) = &self.emitter {
            emitter(event_type, extras);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn machine_with_log() -> (DeviceStateMachine, Arc<Mutex<Vec<EventType>>>) {
        let mut machine = DeviceStateMachine::new(15.0);
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        machine.set_emitter(move |ty, _| log_clone.lock().unwrap().push(ty));
        (machine, log)
    }

    #[test]
    fn test_ignition_cycle() {
        let (mut machine, log) = machine_with_log();

        machine.set_ignition(true);
        assert_eq!(machine.state(), DeviceState::Driving);

        machine.set_ignition(false);
        assert_eq!(machine.state(), DeviceState::Parked);

        assert_eq!(
            *log.lock().unwrap(),
            vec![EventType::IgnitionOn, EventType::IgnitionOff]
        );
    }

    #[test]
    fn test_repeated_input_is_silent() {
        let (mut machine, log) = machine_with_log();

        machine.set_ignition(true);
        machine.set_ignition(true);
        machine.set_motion(true);
        machine.set_motion(true);

        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_motion_restarts_from_parked() {
        let (mut machine, _) = machine_with_log();

        machine.set_ignition(true);
        machine.set_motion(true);
        machine.set_motion(false);
        assert_eq!(machine.state(), DeviceState::Parked);

        machine.set_motion(true);
        assert_eq!(machine.state(), DeviceState::Driving);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parking_timer_expires_to_idle() {
        let (mut machine, _) = machine_with_log();

        machine.set_ignition(true);
        machine.set_ignition(false);
        assert_eq!(machine.state(), DeviceState::Parked);

        tokio::time::advance(Duration::from_secs(119)).await;
        machine.process_timers();
        assert_eq!(machine.state(), DeviceState::Parked);

        tokio::time::advance(Duration::from_secs(2)).await;
        machine.process_timers();
        assert_eq!(machine.state(), DeviceState::Idle);
    }

    #[test]
    fn test_low_battery_crossing_emits_once() {
        let (mut machine, log) = machine_with_log();

        machine.set_battery_level(15.0);
        assert!(log.lock().unwrap().is_empty(), "15.0 is not below threshold");

        machine.set_battery_level(14.999);
        assert_eq!(machine.state(), DeviceState::LowBattery);
        assert_eq!(*log.lock().unwrap(), vec![EventType::LowBattery]);

        // Staying below: no further emission
        machine.set_battery_level(12.0);
        machine.set_battery_level(9.0);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_battery_recovery_follows_ignition() {
        let (mut machine, _) = machine_with_log();

        machine.set_ignition(true);
        machine.set_battery_level(10.0);
        assert_eq!(machine.state(), DeviceState::LowBattery);

        machine.set_battery_level(50.0);
        assert_eq!(machine.state(), DeviceState::Driving);

        machine.set_battery_level(10.0);
        machine.set_ignition(false);
        machine.set_battery_level(50.0);
        assert_eq!(machine.state(), DeviceState::Idle);
    }

    #[test]
    fn test_offline_and_resume() {
        let (mut machine, _) = machine_with_log();

        machine.set_ignition(true);
        machine.set_motion(true);
        machine.set_connection(false);
        assert_eq!(machine.state(), DeviceState::Offline);

        machine.set_connection(true);
        assert_eq!(machine.state(), DeviceState::Driving);
    }

    #[test]
    fn test_offline_resume_respects_battery() {
        let (mut machine, _) = machine_with_log();

        machine.set_connection(false);
        machine.set_battery_level(5.0);
        machine.set_connection(true);
        assert_eq!(machine.state(), DeviceState::LowBattery);
    }

    #[test]
    fn test_speed_limit_edge_triggered() {
        let (mut machine, log) = machine_with_log();

        machine.check_speed(95.0, 90.0);
        machine.check_speed(97.0, 90.0);
        machine.check_speed(99.0, 90.0);
        assert_eq!(log.lock().unwrap().len(), 1);

        machine.check_speed(80.0, 90.0);
        machine.check_speed(95.0, 90.0);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_speed_limit_extras() {
        let mut machine = DeviceStateMachine::new(15.0);
        let extras = Arc::new(Mutex::new(EventExtras::new()));
        let extras_clone = extras.clone();
        machine.set_emitter(move |_, e| *extras_clone.lock().unwrap() = e);

        machine.check_speed(97.4, 90.0);

        let extras = extras.lock().unwrap();
        assert_eq!(extras.get("limit"), Some(&Some("90".to_string())));
        assert_eq!(extras.get("measured"), Some(&Some("97".to_string())));
    }

    #[test]
    fn test_geofence_membership_diffing() {
        let (mut machine, log) = machine_with_log();

        machine.update_geofences(&["office".to_string()]);
        machine.update_geofences(&["office".to_string()]);
        machine.update_geofences(&["office".to_string(), "warehouse".to_string()]);
        machine.update_geofences(&["warehouse".to_string()]);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                EventType::GeofenceEnter,
                EventType::GeofenceEnter,
                EventType::GeofenceExit
            ]
        );
    }

    #[test]
    fn test_idle_ignores_motion_without_ignition() {
        let (mut machine, _) = machine_with_log();

        machine.set_motion(true);
        assert_eq!(machine.state(), DeviceState::Idle);
    }
}
