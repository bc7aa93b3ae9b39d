//! Test support: mock transport and factory
//!
//! Compiled into the library so both unit tests and integration tests can
//! exercise the protocol stack without a broker.

pub mod mocks;

pub use mocks::{MockTransport, MockTransportFactory};
