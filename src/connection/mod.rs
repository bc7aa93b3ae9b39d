//! Connection management: provisioning to a hub session
//!
//! The manager owns every transport instance (hub-and-spoke): a dedicated
//! one for provisioning, then a second one for the assigned hub. Topic
//! construction helpers live here so they can be tested as pure functions.

pub mod manager;

pub use manager::{ConnectionManager, ManagerState, MAX_RECONNECT_ATTEMPTS};

use crate::auth::TokenError;
use crate::provisioning::ProvisioningError;
use crate::transport::{TlsIdentity, TransportError};
use std::time::Duration;
use thiserror::Error;

/// API version sent in the hub MQTT username
pub const HUB_API_VERSION: &str = "2021-04-12";

/// Hub MQTT port
pub const HUB_PORT: u16 = 8883;

/// Connection settings: provisioned X.509 identity or the legacy
/// symmetric-key path
#[derive(Debug, Clone)]
pub enum ConnectionSettings {
    /// Provision through the device provisioning service with an X.509
    /// identity, then connect to the assigned hub
    Provisioned {
        imei: String,
        id_scope: String,
        tls: TlsIdentity,
        timeout: Duration,
    },
    /// Connect straight to a known hub with a shared-access-signature token
    Legacy {
        host: String,
        device_id: String,
        device_key_base64: String,
    },
}

/// Connection-manager errors
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("connection already in progress or established")]
    AlreadyActive,

    #[error("reconnect attempts exhausted after {attempts}")]
    PolicyExhausted { attempts: u32 },
}

impl From<ConnectError> for crate::error::TrackerError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::Transport(e) => Self::Transport(e),
            ConnectError::Provisioning(e) => Self::Provisioning(e),
            ConnectError::Token(e) => Self::Token(e),
            ConnectError::AlreadyActive => {
                Self::Transport(TransportError::ConnectionFailed(err.to_string()))
            }
            ConnectError::PolicyExhausted { attempts } => Self::PolicyExhausted { attempts },
        }
    }
}

/// Device-to-cloud telemetry topic for a device
pub fn telemetry_topic(device_id: &str) -> String {
    format!("devices/{device_id}/messages/events/")
}

/// Cloud-to-device command subscription filter for a device
pub fn command_topic_filter(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/#")
}

/// Resolve a publish topic: relative topics are placed under the
/// device-to-cloud path, absolute topics pass through unchanged.
pub fn resolve_publish_topic(device_id: &str, topic: &str) -> String {
    if topic.starts_with("devices/") || topic.starts_with("$iothub/") {
        topic.to_string()
    } else {
        format!("{}{}", telemetry_topic(device_id), topic)
    }
}

/// Resolve a subscribe topic: relative topics map to the cloud-to-device
/// command filter, absolute topics pass through unchanged.
pub fn resolve_subscribe_topic(device_id: &str, topic: &str) -> String {
    if topic.starts_with("devices/") || topic.starts_with("$iothub/") {
        topic.to_string()
    } else {
        command_topic_filter(device_id)
    }
}
