//! MQTT/TLS transport implementation
//!
//! Split into two focused sub-modules in the same spirit as the rest of the
//! crate: [`connection`] holds the pure pieces (state type, option building,
//! the bounded offline queue) and [`client`] the I/O coordination around the
//! rumqttc event loop.

pub mod client;
pub mod connection;

pub use client::{MqttTransport, MqttTransportFactory};
pub use connection::{ConnectionState, CONNECT_TIMEOUT, KEEP_ALIVE, OFFLINE_QUEUE_CAPACITY};
