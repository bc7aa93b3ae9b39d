//! Tracker simulator: the host runner's view of the whole device
//!
//! Owns the connection manager, twin adapter, state machine, battery and
//! telemetry pipeline and wires them together hub-and-spoke: inbound
//! messages are drained from the manager and routed to the twin adapter or
//! the command handler; domain events flow through the bus into the
//! pipeline. Drive it with `tick()` at roughly 1 Hz.

pub mod battery;
pub mod geo;
pub mod rng;

pub use battery::Battery;
pub use rng::{Rng, SystemRng};

use crate::config::{ConfigError, SimulatorConfig};
use crate::connection::ConnectionManager;
use crate::domain::{
    DeviceState, DeviceStateMachine, EventBus, EventFactory, EventType, Location, NetworkStatus,
    PolicyEngine, TelemetryPipeline, TelemetrySnapshot,
};
use crate::error::TrackerError;
use crate::transport::{Message, TransportFactory};
use crate::twin::{TwinAdapter, TwinStatus};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Event types drawn from during spike generation
const SPIKE_EVENT_TYPES: [EventType; 5] = [
    EventType::MotionStart,
    EventType::MotionStop,
    EventType::IgnitionOn,
    EventType::IgnitionOff,
    EventType::Heartbeat,
];

pub struct Simulator<F: TransportFactory> {
    config: SimulatorConfig,
    manager: ConnectionManager<F>,
    twin: TwinAdapter,
    bus: Arc<EventBus>,
    factory: Arc<EventFactory>,
    pipeline: TelemetryPipeline,
    state_machine: DeviceStateMachine,
    battery: Battery,
    rng: Box<dyn Rng>,
    policies: PolicyEngine,
    snapshot: Arc<Mutex<TelemetrySnapshot>>,

    running: bool,
    twin_started: bool,
    location: Location,
    speed_kph: f64,
    heading: f64,
    network: NetworkStatus,
    route_progress: f64,
    following_route: bool,
    drive_deadline: Option<Instant>,
    last_tick: Instant,
}

impl<F: TransportFactory> Simulator<F> {
    pub fn new(
        config: SimulatorConfig,
        transport_factory: F,
        rng: Box<dyn Rng>,
    ) -> Result<Self, ConfigError> {
        let settings = config.connection_settings()?;
        let manager = ConnectionManager::new(transport_factory, settings);

        let mut policies = PolicyEngine::default();
        policies.reporting.moving_heartbeat =
            Duration::from_secs(config.heartbeat_seconds as u64);
        policies.reporting.stationary_heartbeat =
            Duration::from_secs(config.heartbeat_seconds as u64 * 5);

        let bus = Arc::new(EventBus::new());
        let factory = Arc::new(EventFactory::new(config.device_id.clone()));
        let pipeline = TelemetryPipeline::new(bus.clone(), factory.clone(), policies.clone());

        let network = NetworkStatus {
            rssi: -72,
            rat: "LTE".to_string(),
        };
        let snapshot = Arc::new(Mutex::new(TelemetrySnapshot {
            location: config.start_location,
            network: network.clone(),
            ..TelemetrySnapshot::default()
        }));

        let mut state_machine =
            DeviceStateMachine::new(policies.power.low_battery_threshold_pct);
        let emitter_bus = bus.clone();
        let emitter_factory = factory.clone();
        let emitter_snapshot = snapshot.clone();
        state_machine.set_emitter(move |event_type, extras| {
            let snap = emitter_snapshot
                .lock()
                .expect("snapshot lock poisoned")
                .clone();
            emitter_bus.publish(emitter_factory.create_with_extras(event_type, &snap, extras));
        });

        let twin = Self::build_twin_adapter(&config.device_id);

        Ok(Self {
            location: config.start_location,
            following_route: !config.route.is_empty(),
            config,
            manager,
            twin,
            bus,
            factory,
            pipeline,
            state_machine,
            battery: Battery::new(),
            rng,
            policies,
            snapshot,
            running: false,
            twin_started: false,
            speed_kph: 0.0,
            heading: 0.0,
            network,
            route_progress: 0.0,
            drive_deadline: None,
            last_tick: Instant::now(),
        })
    }

    fn build_twin_adapter(device_id: &str) -> TwinAdapter {
        let mut twin = TwinAdapter::new(device_id);
        twin.set_config_observer(|result, _| {
            if result.status == TwinStatus::Success {
                info!(
                    version = %result.config_version,
                    changed = result.has_changes,
                    "configuration applied"
                );
            } else {
                warn!(
                    version = %result.config_version,
                    "configuration apply failed: {}",
                    result.error_message
                );
            }
        });
        twin.set_response_observer(|status, message| {
            if status != TwinStatus::Success {
                warn!("twin operation failed: {message}");
            }
        });
        twin
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn device_state(&self) -> DeviceState {
        self.state_machine.state()
    }

    pub fn manager(&self) -> &ConnectionManager<F> {
        &self.manager
    }

    pub fn battery_percentage(&self) -> f64 {
        self.battery.percentage()
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn speed_kph(&self) -> f64 {
        self.speed_kph
    }

    /// Start the simulation and begin connecting
    pub async fn start(&mut self) -> Result<(), TrackerError> {
        if self.running {
            return Ok(());
        }

        self.running = true;
        self.last_tick = Instant::now();
        self.pipeline.start();
        self.manager.connect().await.map_err(TrackerError::from)?;
        Ok(())
    }

    /// Stop the simulation and tear down connections
    pub async fn stop(&mut self) {
        self.running = false;
        self.pipeline.stop();
        self.manager.disconnect().await;
        self.twin_started = false;
    }

    /// One simulation frame: battery drain, movement, geofences, connection
    /// progress, inbound routing, event dispatch and telemetry.
    pub async fn tick(&mut self) {
        if !self.running {
            return;
        }

        let delta_seconds = self.last_tick.elapsed().as_secs_f64();
        self.last_tick = Instant::now();

        let in_motion = self.speed_kph > 0.0;
        let drain = self
            .policies
            .power
            .drain_rate(in_motion, self.manager.is_connected());
        self.battery.tick(delta_seconds, drain, self.rng.as_mut());
        self.state_machine.set_battery_level(self.battery.percentage());

        self.update_location(delta_seconds);
        let inside = geo::geofences_containing(&self.location, &self.config.geofences);
        self.state_machine.update_geofences(&inside);

        if let Some(deadline) = self.drive_deadline {
            if Instant::now() >= deadline {
                self.drive_deadline = None;
                info!("drive session complete");
                self.set_speed(0.0);
                self.set_ignition(false);
            }
        }

        self.refresh_snapshot();

        self.manager.process_events().await;
        self.state_machine.set_connection(self.manager.is_connected());
        if !self.manager.is_connected() {
            // A fresh hub session needs fresh twin subscriptions
            self.twin_started = false;
        }

        self.start_twin_if_ready().await;
        self.route_inbound().await;

        self.state_machine.process_timers();
        self.bus.process_events();

        let snapshot = self
            .snapshot
            .lock()
            .expect("snapshot lock poisoned")
            .clone();
        self.pipeline
            .process_events(self.manager.hub(), &snapshot)
            .await;
    }

    /// After the hub session comes up, adopt the assigned device id and
    /// bring the twin adapter online
    async fn start_twin_if_ready(&mut self) {
        if self.twin_started || !self.manager.is_connected() {
            return;
        }

        let device_id = self
            .manager
            .device_id()
            .unwrap_or_else(|| self.config.device_id.clone());
        self.factory.set_device_id(device_id.clone());
        self.config.device_id = device_id.clone();

        let mut twin = Self::build_twin_adapter(&device_id);
        let Some(hub) = self.manager.hub() else { return };

        match twin.initialize(hub).await {
            Ok(()) => {
                if let Err(e) = twin.request_full_twin(hub, "1").await {
                    warn!("twin request failed: {e}");
                }
                self.twin = twin;
                self.twin_started = true;
            }
            Err(e) => warn!("twin initialization failed: {e}"),
        }
    }

    /// Drain inbound hub messages: twin traffic to the adapter, everything
    /// on the devicebound topic to the command handler
    async fn route_inbound(&mut self) {
        let mut inbound = Vec::new();
        while let Some(message) = self.manager.try_recv() {
            inbound.push(message);
        }

        for message in inbound {
            if TwinAdapter::is_twin_topic(&message.topic) {
                if let Some(hub) = self.manager.hub() {
                    self.twin.handle_message(hub, &message).await;
                }
            } else if message.topic.contains("/messages/devicebound") {
                self.handle_command(&message).await;
            }
        }
    }

    /// Cloud-to-device command handling: `{"cmd": ..., "value": ...}`
    async fn handle_command(&mut self, message: &Message) {
        let payload: serde_json::Value = match serde_json::from_slice(&message.payload) {
            Ok(value) => value,
            Err(e) => {
                warn!("dropping malformed command payload: {e}");
                return;
            }
        };

        let Some(cmd) = payload.get("cmd").and_then(|c| c.as_str()) else {
            warn!("command payload missing cmd field, ignored");
            return;
        };

        match cmd {
            "setHeartbeatSeconds" => {
                if let Some(seconds) = payload.get("value").and_then(|v| v.as_u64()) {
                    info!(seconds, "heartbeat interval updated by command");
                    self.config.heartbeat_seconds = seconds as u32;
                    self.pipeline.set_heartbeat_seconds(seconds);
                }
            }
            "setSpeedLimit" => {
                if let Some(limit) = payload.get("value").and_then(|v| v.as_f64()) {
                    info!(limit, "speed limit updated by command");
                    self.config.speed_limit_kph = limit;
                }
            }
            "reboot" => {
                info!("reboot command received");
                self.stop().await;
                tokio::time::sleep(Duration::from_secs(2)).await;
                if let Err(e) = self.start().await {
                    error!("restart after reboot failed: {e}");
                }
            }
            other => {
                warn!(command = other, "unknown command ignored");
            }
        }
    }

    /// Toggle the ignition input
    pub fn set_ignition(&mut self, on: bool) {
        self.state_machine.set_ignition(on);
    }

    /// Set the vehicle speed, driving motion and speed-limit events
    pub fn set_speed(&mut self, speed_kph: f64) {
        let was_moving = self.speed_kph > 0.0;
        let is_moving = speed_kph > 0.0;
        self.speed_kph = speed_kph.max(0.0);
        self.refresh_snapshot();

        if was_moving != is_moving {
            self.state_machine.set_motion(is_moving);
        }
        self.state_machine
            .check_speed(self.speed_kph, self.config.speed_limit_kph);
    }

    /// Override the battery percentage. Wins over drain for the tick it
    /// lands in; drain resumes on the next tick.
    pub fn set_battery_percentage(&mut self, pct: f64) {
        self.battery.set_percentage(pct);
        self.refresh_snapshot();
        self.state_machine.set_battery_level(self.battery.percentage());
    }

    /// Begin an automated drive session
    pub fn start_driving(&mut self, duration_minutes: f64) {
        info!(minutes = duration_minutes, "starting drive session");
        self.set_ignition(true);
        let speed = 45.0 + self.rng.uniform(-15.0, 15.0);
        self.set_speed(speed);
        self.drive_deadline =
            Some(Instant::now() + Duration::from_secs_f64(duration_minutes * 60.0));

        if !self.config.route.is_empty() {
            self.following_route = true;
            self.route_progress = 0.0;
        }
    }

    /// Emit a burst of random events with 100 ms spacing, for load testing
    pub async fn generate_spike(&mut self, count: u32) {
        info!(count, "generating event spike");
        for _ in 0..count {
            let index = self.rng.uniform_int(0, SPIKE_EVENT_TYPES.len() as i64 - 1) as usize;
            let snapshot = self
                .snapshot
                .lock()
                .expect("snapshot lock poisoned")
                .clone();
            self.bus
                .publish(self.factory.create(SPIKE_EVENT_TYPES[index], &snapshot));
            self.bus.process_events();
            self.pipeline
                .process_events(self.manager.hub(), &snapshot)
                .await;

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn update_location(&mut self, delta_seconds: f64) {
        if self.following_route && !self.config.route.is_empty() {
            if self.speed_kph > 0.0 {
                let speed_ms = self.speed_kph / 3.6;
                self.route_progress += (speed_ms * delta_seconds) / 1000.0;
            }
            self.location =
                geo::interpolate_route(&self.config.route, self.route_progress, &self.location);

            if self.route_progress >= 1.0 {
                self.route_progress = 1.0;
                self.following_route = false;
                self.set_speed(0.0);
            }
        } else if self.speed_kph > 0.0 {
            self.heading = (self.heading + self.rng.normal(0.0, 5.0)).rem_euclid(360.0);
            let distance = (self.speed_kph / 3.6) * delta_seconds;
            self.location = geo::move_location(&self.location, self.heading, distance);
        }
    }

    fn refresh_snapshot(&mut self) {
        let battery = self.battery.status(self.rng.as_mut());
        *self.snapshot.lock().expect("snapshot lock poisoned") = TelemetrySnapshot {
            location: self.location,
            speed_kph: self.speed_kph,
            heading: self.heading,
            battery,
            network: self.network.clone(),
        };
    }
}

/// Events currently queued on the bus plus retries; exposed for shutdown
/// decisions in the host runner
impl<F: TransportFactory> Simulator<F> {
    pub fn pending_work(&self) -> usize {
        self.bus.pending() + self.pipeline.retry_queue_len()
    }
}
