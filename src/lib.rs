//! GPS tracker device client and simulator
//!
//! A tracker device client that authenticates to a cloud IoT service with
//! X.509 client certificates, obtains its hub assignment through the device
//! provisioning service over MQTT/TLS, then maintains a persistent hub
//! session to publish telemetry and receive configuration. The simulation
//! side drives it: a device state machine, battery model, geofencing,
//! route-following GPS motion and bursty event generation for load tests.
//!
//! # Architecture
//!
//! - [`transport`] - MQTT/TLS sessions behind the `Transport` seam
//! - [`provisioning`] - registration → assignment state machine
//! - [`connection`] - connection manager bridging provisioning to the hub
//! - [`twin`] - device-twin adapter with atomic config persistence
//! - [`domain`] - events, state machine, event bus, telemetry pipeline,
//!   policies
//! - [`sim`] - the simulator tying it all together
//! - [`auth`] - shared-access-signature tokens for the legacy path
//!
//! # Quick start
//!
//! ```rust,no_run
//! use tracksim::config::SimulatorConfig;
//! use tracksim::sim::{Simulator, SystemRng};
//! use tracksim::transport::MqttTransportFactory;
//!
//! # tokio_test::block_on(async {
//! let config = SimulatorConfig::load(std::path::Path::new("simulator.toml"))?;
//! let mut simulator =
//!     Simulator::new(config, MqttTransportFactory, Box::new(SystemRng::new()))?;
//!
//! simulator.start().await?;
//! for _ in 0..60 {
//!     simulator.tick().await;
//!     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//! }
//! simulator.stop().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod domain;
pub mod error;
pub mod logging;
pub mod provisioning;
pub mod sim;
pub mod testing;
pub mod transport;
pub mod twin;

pub use config::SimulatorConfig;
pub use connection::{ConnectionManager, ManagerState};
pub use domain::{Event, EventBus, EventType};
pub use error::{TrackerError, TrackerResult};
pub use provisioning::{Assignment, ProvisioningClient, ProvisioningState};
pub use sim::Simulator;
pub use transport::{MqttTransport, Transport};
pub use twin::TwinAdapter;
