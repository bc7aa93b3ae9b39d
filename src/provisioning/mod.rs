//! Device provisioning over MQTT/TLS
//!
//! Drives the registration → assignment state machine against the
//! provisioning service: connect with the X.509 identity, publish a
//! registration request, then poll the operation status until a hub is
//! assigned or the deadline passes.
//!
//! ```text
//! Idle ──start──▶ Connecting ──connack──▶ Registering
//! Registering ──"assigning"──▶ Polling (remember operation id)
//! Registering/Polling ──"assigned"──▶ Completed
//! Polling ──tick (2 s)──▶ publish status poll
//! any non-terminal ──deadline 120 s──▶ Failed
//! ```
//!
//! Registration itself is never retried; only the status poll repeats.

use crate::transport::{Endpoint, Message, QosLevel, TlsIdentity, Transport, TransportError};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// API version sent in the provisioning MQTT username
pub const DPS_API_VERSION: &str = "2019-03-31";

/// Default provisioning service endpoint
pub const DPS_GLOBAL_ENDPOINT: &str = "global.azure-devices-provisioning.net";

/// Overall wall-clock budget for one provisioning run
pub const PROVISIONING_TIMEOUT: Duration = Duration::from_secs(120);

/// Cadence of assignment-status polls
const POLL_INTERVAL: Duration = Duration::from_secs(2);

const RESPONSE_TOPIC_FILTER: &str = "$dps/registrations/res/#";
const RESPONSE_TOPIC_PREFIX: &str = "$dps/registrations/res/";
const REGISTER_TOPIC: &str = "$dps/registrations/PUT/iotdps-register/?$rid=1";

/// Hub assignment produced by a successful provisioning run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub assigned_hub: String,
    pub device_id: String,
}

/// Provisioning failures
#[derive(Debug, Clone, Error)]
pub enum ProvisioningError {
    #[error("provisioning timed out after {0:?}")]
    Timeout(Duration),

    #[error("provisioning refused with status {status:?}")]
    Refused { status: String },

    #[error("assignment response missing hub or device id")]
    MissingAssignment,

    #[error("provisioning canceled")]
    Canceled,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Provisioning state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Idle,
    Connecting,
    Registering,
    Polling,
    Completed,
    Failed,
}

impl ProvisioningState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProvisioningState::Completed | ProvisioningState::Failed)
    }
}

/// Configuration for one provisioning run
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Service ID scope
    pub id_scope: String,
    /// Registration id; the device IMEI
    pub registration_id: String,
    /// Provisioning endpoint hostname
    pub endpoint_host: String,
    pub port: u16,
    pub tls: TlsIdentity,
    pub timeout: Duration,
}

impl ProvisioningConfig {
    pub fn new(
        id_scope: impl Into<String>,
        registration_id: impl Into<String>,
        tls: TlsIdentity,
    ) -> Self {
        Self {
            id_scope: id_scope.into(),
            registration_id: registration_id.into(),
            endpoint_host: DPS_GLOBAL_ENDPOINT.to_string(),
            port: 8883,
            tls,
            timeout: PROVISIONING_TIMEOUT,
        }
    }

    /// MQTT username for the provisioning session
    pub fn username(&self) -> String {
        format!(
            "{}/registrations/{}/api-version={}",
            self.id_scope, self.registration_id, DPS_API_VERSION
        )
    }
}

/// Registration/operation-status response payload.
///
/// Only the fields the state machine acts on are modeled; unknown keys are
/// ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RegistrationResponse {
    status: String,
    #[serde(rename = "operationId")]
    operation_id: String,
    #[serde(rename = "assignedHub")]
    assigned_hub: String,
    #[serde(rename = "deviceId")]
    device_id: String,
}

/// Provisioning protocol client.
///
/// Owns a dedicated transport for the provisioning session. Drive it with
/// [`start`](ProvisioningClient::start) followed by repeated
/// [`process_events`](ProvisioningClient::process_events) calls; the terminal
/// outcome is yielded exactly once and the transport is disconnected before
/// it is returned.
pub struct ProvisioningClient<T: Transport> {
    transport: T,
    config: ProvisioningConfig,
    state: ProvisioningState,
    operation_id: String,
    started_at: Instant,
    last_poll_at: Instant,
    outcome: Option<Result<Assignment, ProvisioningError>>,
}

impl<T: Transport> ProvisioningClient<T> {
    pub fn new(transport: T, config: ProvisioningConfig) -> Self {
        let now = Instant::now();
        Self {
            transport,
            config,
            state: ProvisioningState::Idle,
            operation_id: String::new(),
            started_at: now,
            last_poll_at: now,
            outcome: None,
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    /// Connect to the provisioning endpoint and publish the registration
    /// request. On success the client is in `Registering` and must be driven
    /// with `process_events`.
    pub async fn start(&mut self) -> Result<(), ProvisioningError> {
        self.state = ProvisioningState::Connecting;
        self.started_at = Instant::now();
        self.last_poll_at = self.started_at;

        info!(
            registration_id = %self.config.registration_id,
            id_scope = %self.config.id_scope,
            endpoint = %self.config.endpoint_host,
            "starting provisioning"
        );

        let endpoint = Endpoint::with_client_certificate(
            self.config.endpoint_host.clone(),
            self.config.port,
            self.config.registration_id.clone(),
            self.config.username(),
            self.config.tls.clone(),
        );

        if let Err(e) = self.transport.connect(endpoint).await {
            return Err(self.fail(e.into()).await);
        }

        if let Err(e) = self
            .transport
            .subscribe(RESPONSE_TOPIC_FILTER, QosLevel::AtLeastOnce)
            .await
        {
            return Err(self.fail(e.into()).await);
        }

        let payload = format!(
            "{{\"registrationId\":\"{}\"}}",
            self.config.registration_id
        );
        if let Err(e) = self
            .transport
            .publish(REGISTER_TOPIC, payload.into_bytes(), QosLevel::AtLeastOnce, false)
            .await
        {
            return Err(self.fail(e.into()).await);
        }

        self.state = ProvisioningState::Registering;
        debug!("registration request sent");
        Ok(())
    }

    /// Advance the state machine: drain responses, enforce the deadline and
    /// keep the status poll ticking. Returns the terminal outcome once.
    pub async fn process_events(&mut self) -> Option<Result<Assignment, ProvisioningError>> {
        if self.state.is_terminal() {
            return self.outcome.take();
        }
        if self.state == ProvisioningState::Idle {
            return None;
        }

        if self.started_at.elapsed() >= self.config.timeout {
            let timeout = self.config.timeout;
            self.fail(ProvisioningError::Timeout(timeout)).await;
            return self.outcome.take();
        }

        while let Some(message) = self.transport.try_recv() {
            self.handle_message(&message);
            if self.state.is_terminal() {
                let _ = self.transport.disconnect().await;
                return self.outcome.take();
            }
        }

        if self.state == ProvisioningState::Polling
            && self.last_poll_at.elapsed() >= POLL_INTERVAL
        {
            self.last_poll_at = Instant::now();
            let topic = format!(
                "$dps/registrations/GET/iotdps-get-operationstatus/?$rid=2&operationId={}",
                self.operation_id
            );
            if let Err(e) = self
                .transport
                .publish(&topic, Vec::new(), QosLevel::AtLeastOnce, false)
                .await
            {
                debug!("status poll publish failed: {e}");
            }
        }

        None
    }

    /// Abort provisioning and disconnect. Safe to call in any state.
    pub async fn cancel(&mut self) {
        if !self.state.is_terminal() && self.state != ProvisioningState::Idle {
            self.state = ProvisioningState::Failed;
            self.outcome = Some(Err(ProvisioningError::Canceled));
        }
        let _ = self.transport.disconnect().await;
    }

    /// The transport, for tests that need to inspect the session afterwards
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn handle_message(&mut self, message: &Message) {
        if !message.topic.starts_with(RESPONSE_TOPIC_PREFIX) {
            return;
        }

        debug!(topic = %message.topic, "provisioning response received");

        let response: RegistrationResponse =
            serde_json::from_slice(&message.payload).unwrap_or_default();

        match response.status.as_str() {
            "assigning" => {
                if self.state == ProvisioningState::Registering {
                    self.operation_id = response.operation_id;
                    self.state = ProvisioningState::Polling;
                    info!(operation_id = %self.operation_id, "assignment in progress");
                }
                // Already polling: keep waiting for the next status poll
            }
            "assigned" => {
                if response.assigned_hub.is_empty() || response.device_id.is_empty() {
                    self.state = ProvisioningState::Failed;
                    self.outcome = Some(Err(ProvisioningError::MissingAssignment));
                    return;
                }
                info!(
                    hub = %response.assigned_hub,
                    device_id = %response.device_id,
                    "device assigned"
                );
                self.state = ProvisioningState::Completed;
                self.outcome = Some(Ok(Assignment {
                    assigned_hub: response.assigned_hub,
                    device_id: response.device_id,
                }));
            }
            other => {
                warn!(status = %other, "provisioning refused");
                self.state = ProvisioningState::Failed;
                self.outcome = Some(Err(ProvisioningError::Refused {
                    status: other.to_string(),
                }));
            }
        }
    }

    /// Record a failure, disconnect, and hand back the error for callers
    /// that propagate it directly.
    async fn fail(&mut self, error: ProvisioningError) -> ProvisioningError {
        self.state = ProvisioningState::Failed;
        let _ = self.transport.disconnect().await;
        self.outcome = Some(Err(error.clone()));
        error
    }
}
