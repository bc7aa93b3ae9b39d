//! Device-twin protocol adapter
//!
//! Mirrors the cloud-held twin document onto the device: requests the full
//! twin, applies desired-property updates, persists the applied
//! configuration atomically and reports acknowledgments back on the
//! `reported` channel.

pub mod handler;

pub use handler::{
    TwinAdapter, TwinError, TwinStatus, TwinUpdateResult, APPLIED_CONFIG_FILE, ERROR_FILE,
};
