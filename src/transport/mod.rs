//! Transport layer for cloud connectivity
//!
//! Provides the transport abstraction the upper layers are written against,
//! plus the MQTT/TLS implementation. The trait seam exists for dependency
//! injection: the provisioning client, connection manager, twin adapter and
//! telemetry pipeline only ever see `Transport`, which keeps them testable
//! against the mock in [`crate::testing`].

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

pub mod mqtt;

pub use mqtt::{ConnectionState, MqttTransport, MqttTransportFactory};

/// MQTT quality-of-service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QosLevel {
    /// At most once (0)
    AtMostOnce,
    /// At least once (1)
    AtLeastOnce,
    /// Exactly once (2)
    ExactlyOnce,
}

impl QosLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

/// A transport-layer message, inbound or outbound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosLevel,
    pub retained: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QosLevel::AtMostOnce,
            retained: false,
        }
    }

    /// Payload interpreted as UTF-8, lossily
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// X.509 client identity used for certificate-based TLS sessions.
///
/// The identity is fixed for the lifetime of a session; it is never rotated
/// at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsIdentity {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    pub verify_server: bool,
}

impl TlsIdentity {
    /// Check that every certificate file exists and is readable.
    ///
    /// Runs before any handshake is attempted so a bad deployment fails
    /// immediately with a path in the error.
    pub fn validate(&self) -> Result<(), TransportError> {
        for path in [&self.cert_path, &self.key_path, &self.ca_path] {
            if std::fs::File::open(path).is_err() {
                return Err(TransportError::MissingCertificate { path: path.clone() });
            }
        }
        Ok(())
    }
}

/// Authentication material for a broker session
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Username/password (SAS token) authentication; TLS with server
    /// verification against the system trust roots
    Password { username: String, password: String },
    /// X.509 client-certificate authentication. The username still travels
    /// in the CONNECT packet (the broker derives the API version from it);
    /// the password stays empty.
    ClientCertificate {
        username: String,
        identity: TlsIdentity,
    },
}

/// One broker endpoint with everything needed to open a session
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Credentials,
}

impl Endpoint {
    pub fn with_password(
        host: impl Into<String>,
        port: u16,
        client_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            credentials: Credentials::Password {
                username: username.into(),
                password: password.into(),
            },
        }
    }

    pub fn with_client_certificate(
        host: impl Into<String>,
        port: u16,
        client_id: impl Into<String>,
        username: impl Into<String>,
        identity: TlsIdentity,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            credentials: Credentials::ClientCertificate {
                username: username.into(),
                identity,
            },
        }
    }

    /// Username carried in the CONNECT packet
    pub fn username(&self) -> &str {
        match &self.credentials {
            Credentials::Password { username, .. } => username,
            Credentials::ClientCertificate { username, .. } => username,
        }
    }
}

/// Transport errors
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("certificate file missing or unreadable: {path}")]
    MissingCertificate { path: PathBuf },

    #[error("not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("no CONNACK received within {0:?}")]
    ConnackTimeout(std::time::Duration),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
}

/// Abstraction over an MQTT session.
///
/// A transport instance is single-shot: `connect` opens one session and a
/// lost session parks the transport at `Disconnected`. Reconnection policy
/// belongs to the connection manager, which builds fresh instances through a
/// [`TransportFactory`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session to the endpoint. Resolves once the broker has
    /// acknowledged the connection, or fails within the connect timeout.
    async fn connect(&mut self, endpoint: Endpoint) -> Result<(), TransportError>;

    /// Close the session. Idempotent.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    fn connection_state(&self) -> ConnectionState;

    /// Publish a message.
    ///
    /// While disconnected the message is enqueued (bounded FIFO, oldest
    /// dropped on overflow) for delivery once a session is established, and
    /// `TransportError::NotConnected` is returned so callers can apply their
    /// own retry policy on top.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retained: bool,
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Pop the next inbound message, if one has arrived.
    ///
    /// Inbound delivery is serialized through this queue; there are no
    /// reentrant callbacks.
    fn try_recv(&self) -> Option<Message>;

    /// Perform bounded housekeeping. Safe to call at any time; network I/O
    /// itself runs on the transport's own task and inbound messages surface
    /// through `try_recv`, so the default is a no-op.
    fn process_events(&self) {}
}

/// Factory seam so the connection manager can open additional sessions
/// (provisioning first, then the assigned hub) without knowing the concrete
/// transport type.
pub trait TransportFactory: Send + Sync {
    type Transport: Transport;

    fn create(&self) -> Self::Transport;
}
