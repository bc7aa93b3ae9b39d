//! Pure connection-state management for the MQTT transport
//!
//! Option building, TLS material loading, the telemetry system-property
//! rewrite and the bounded offline queue live here so they can be tested
//! without touching the network.

use crate::transport::{Credentials, Endpoint, QosLevel, TransportError};
use rumqttc::{MqttOptions, TlsConfiguration, Transport as RumqttcTransport};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::warn;

/// MQTT keep-alive interval
pub const KEEP_ALIVE: Duration = Duration::from_secs(240);

/// How long to wait for the broker to acknowledge a connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of messages held while disconnected
pub const OFFLINE_QUEUE_CAPACITY: usize = 100;

/// System properties appended to device-to-cloud telemetry topics so the hub
/// records the payload as JSON/UTF-8
const TELEMETRY_SYSTEM_PROPERTIES: &str = "$.ct=application%2Fjson&$.ce=utf-8";

/// Connection state for the MQTT transport
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session has been opened yet
    #[default]
    Idle,
    /// CONNECT sent, waiting for the broker acknowledgment
    Connecting,
    /// Session established and ready for traffic
    Connected,
    /// Session closed or lost, with reason
    Disconnected(String),
}

/// Build rumqttc options for an endpoint.
///
/// Both authentication paths run over TLS; the certificate path loads the
/// identity files here, which is why [`crate::transport::TlsIdentity::validate`]
/// must have passed first.
pub fn configure_mqtt_options(endpoint: &Endpoint) -> Result<MqttOptions, TransportError> {
    let mut options = MqttOptions::new(&endpoint.client_id, &endpoint.host, endpoint.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);

    match &endpoint.credentials {
        Credentials::Password { username, password } => {
            options.set_credentials(username, password);
            // Server verification against the system trust roots. The wire
            // protocol ancestors of this client disabled verification on the
            // password path; that downgrade is no longer offered.
            options.set_transport(RumqttcTransport::tls_with_default_config());
        }
        Credentials::ClientCertificate { username, identity } => {
            options.set_credentials(username, "");

            if !identity.verify_server {
                warn!(
                    ca = %identity.ca_path.display(),
                    "verify_server=false requested; server verification against the \
                     configured CA remains enabled"
                );
            }

            let read = |path: &std::path::PathBuf| {
                std::fs::read(path).map_err(|_| TransportError::MissingCertificate {
                    path: path.clone(),
                })
            };
            let ca = read(&identity.ca_path)?;
            let client_cert = read(&identity.cert_path)?;
            let client_key = read(&identity.key_path)?;

            options.set_transport(RumqttcTransport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: Some((client_cert, client_key)),
            }));
        }
    }

    Ok(options)
}

/// Rewrite an outbound topic, appending the JSON/UTF-8 system properties on
/// device-to-cloud telemetry topics. All other topics pass through.
pub fn apply_system_properties(topic: &str) -> String {
    if topic.contains("messages/events") {
        format!("{topic}{TELEMETRY_SYSTEM_PROPERTIES}")
    } else {
        topic.to_string()
    }
}

/// An outbound message parked while the transport is disconnected
#[derive(Debug, Clone)]
pub struct PendingPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosLevel,
    pub retained: bool,
}

/// Bounded FIFO of messages awaiting a session.
///
/// On overflow the oldest entry is dropped so memory stays bounded while the
/// most recent telemetry survives.
#[derive(Debug, Default)]
pub struct OfflineQueue {
    entries: VecDeque<PendingPublish>,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message; returns the dropped entry when the queue was full.
    pub fn push(&mut self, message: PendingPublish) -> Option<PendingPublish> {
        let dropped = if self.entries.len() >= OFFLINE_QUEUE_CAPACITY {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(message);
        dropped
    }

    pub fn pop(&mut self) -> Option<PendingPublish> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
