//! Domain core: events, the device state machine, the telemetry pipeline
//! and the policies that drive them
//!
//! Nothing in here touches the network directly; the pipeline publishes
//! through the [`crate::transport::Transport`] seam and everything else is
//! pure state.

pub mod bus;
pub mod event;
pub mod pipeline;
pub mod policy;
pub mod state_machine;

pub use bus::EventBus;
pub use event::{
    utc_timestamp, BatteryStatus, Event, EventFactory, EventType, Location, NetworkStatus,
    TelemetrySnapshot,
};
pub use pipeline::{TelemetryPipeline, RETRY_QUEUE_CAPACITY};
pub use policy::{PolicyEngine, PowerPolicy, ReportingPolicy, RetryPolicy};
pub use state_machine::{DeviceState, DeviceStateMachine};
