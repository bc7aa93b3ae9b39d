//! Connection manager bridging provisioning to a long-lived hub session
//!
//! One user-facing state machine: `Disconnected → Provisioning →
//! ConnectingToHub → Connected`, with `Failed` as the terminal error state.
//! After the first successful hub session, any connection loss re-runs the
//! full connect flow under an exponential backoff capped at
//! [`MAX_RECONNECT_ATTEMPTS`] attempts.

use super::{
    command_topic_filter, resolve_publish_topic, resolve_subscribe_topic, ConnectError,
    ConnectionSettings, HUB_API_VERSION, HUB_PORT,
};
use crate::auth;
use crate::provisioning::{
    Assignment, ProvisioningClient, ProvisioningConfig, ProvisioningError,
};
use crate::transport::{
    Endpoint, Message, QosLevel, Transport, TransportError, TransportFactory,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Reconnect attempts before the manager surfaces a terminal failure
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// SAS token validity on the legacy path
const LEGACY_TOKEN_VALIDITY: u64 = 3600;

/// Connection manager states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Disconnected,
    Provisioning,
    ConnectingToHub,
    Connected,
    Failed,
}

/// Orchestrates provisioning and the hub session over transports created by
/// the factory.
pub struct ConnectionManager<F: TransportFactory> {
    factory: F,
    settings: ConnectionSettings,
    state: ManagerState,
    provisioning: Option<ProvisioningClient<F::Transport>>,
    hub: Option<F::Transport>,
    assignment: Option<Assignment>,
    failure: Option<ConnectError>,
    reconnect_armed: bool,
    reconnect_attempts: u32,
    next_reconnect_at: Option<Instant>,
}

impl<F: TransportFactory> ConnectionManager<F> {
    pub fn new(factory: F, settings: ConnectionSettings) -> Self {
        Self {
            factory,
            settings,
            state: ManagerState::Disconnected,
            provisioning: None,
            hub: None,
            assignment: None,
            failure: None,
            reconnect_armed: false,
            reconnect_attempts: 0,
            next_reconnect_at: None,
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ManagerState::Connected
            && self.hub.as_ref().is_some_and(|h| h.is_connected())
    }

    pub fn assignment(&self) -> Option<&Assignment> {
        self.assignment.as_ref()
    }

    /// Device id for topic construction: the assigned id once provisioned,
    /// the configured id on the legacy path.
    pub fn device_id(&self) -> Option<String> {
        match (&self.assignment, &self.settings) {
            (Some(assignment), _) => Some(assignment.device_id.clone()),
            (None, ConnectionSettings::Legacy { device_id, .. }) => Some(device_id.clone()),
            (None, ConnectionSettings::Provisioned { .. }) => None,
        }
    }

    /// Terminal failure, if the manager has given up
    pub fn failure(&self) -> Option<&ConnectError> {
        self.failure.as_ref()
    }

    /// Direct access to the hub transport for protocol adapters (twin)
    pub fn hub(&self) -> Option<&F::Transport> {
        self.hub.as_ref()
    }

    /// Begin the connect flow. Single-shot: a manager that is already
    /// connecting or connected must be disconnected first.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if !matches!(
            self.state,
            ManagerState::Disconnected | ManagerState::Failed
        ) {
            return Err(ConnectError::AlreadyActive);
        }
        self.failure = None;
        self.begin_connect().await
    }

    async fn begin_connect(&mut self) -> Result<(), ConnectError> {
        match self.settings.clone() {
            ConnectionSettings::Provisioned {
                imei,
                id_scope,
                tls,
                timeout,
            } => {
                if let Err(e) = tls.validate() {
                    return Err(self.connection_failed(e.into()));
                }

                self.state = ManagerState::Provisioning;
                let mut config = ProvisioningConfig::new(id_scope, imei, tls);
                config.timeout = timeout;
                let mut client = ProvisioningClient::new(self.factory.create(), config);

                if let Err(e) = client.start().await {
                    return Err(self.connection_failed(e.into()));
                }
                self.provisioning = Some(client);
                Ok(())
            }
            ConnectionSettings::Legacy {
                host,
                device_id,
                device_key_base64,
            } => {
                let token = match (auth::SasTokenConfig {
                    host: host.clone(),
                    device_id: device_id.clone(),
                    device_key_base64,
                    validity_seconds: LEGACY_TOKEN_VALIDITY,
                })
                .generate()
                {
                    Ok(token) => token,
                    Err(e) => return Err(self.connection_failed(e.into())),
                };

                self.assignment = Some(Assignment {
                    assigned_hub: host,
                    device_id,
                });
                match self.open_hub_session(Some(token)).await {
                    Ok(()) => Ok(()),
                    Err(e) => Err(self.connection_failed(e)),
                }
            }
        }
    }

    /// Drive whichever leg of the connection is active; apply the reconnect
    /// policy after a hub session has been lost.
    pub async fn process_events(&mut self) {
        match self.state {
            ManagerState::Provisioning => {
                let Some(client) = self.provisioning.as_mut() else {
                    return;
                };
                if let Some(outcome) = client.process_events().await {
                    self.provisioning = None;
                    match outcome {
                        Ok(assignment) => {
                            info!(
                                hub = %assignment.assigned_hub,
                                device_id = %assignment.device_id,
                                "provisioning complete, connecting to hub"
                            );
                            self.assignment = Some(assignment);
                            if let Err(e) = self.open_hub_session(None).await {
                                self.connection_failed(e);
                            }
                        }
                        Err(e) => {
                            self.connection_failed(e.into());
                        }
                    }
                }
            }
            ManagerState::Connected => {
                let lost = self.hub.as_ref().is_some_and(|h| !h.is_connected());
                if lost {
                    warn!("hub session lost");
                    self.hub = None;
                    self.state = ManagerState::Disconnected;
                    self.schedule_reconnect();
                }
            }
            ManagerState::Disconnected => {
                if let Some(due) = self.next_reconnect_at {
                    if Instant::now() >= due {
                        self.next_reconnect_at = None;
                        info!(
                            attempt = self.reconnect_attempts,
                            max = MAX_RECONNECT_ATTEMPTS,
                            "attempting reconnection"
                        );
                        if let Err(e) = self.begin_connect().await {
                            // begin_connect already routed the failure
                            // through connection_failed; nothing more to do
                            let _ = e;
                        }
                    }
                }
            }
            ManagerState::ConnectingToHub | ManagerState::Failed => {}
        }
    }

    /// Open the hub session with the current assignment. `password` carries
    /// the SAS token on the legacy path; the provisioned path authenticates
    /// with the client certificate.
    async fn open_hub_session(&mut self, password: Option<String>) -> Result<(), ConnectError> {
        let assignment = self
            .assignment
            .clone()
            .ok_or(ProvisioningError::MissingAssignment)?;

        self.state = ManagerState::ConnectingToHub;

        let username = format!(
            "{}/{}/?api-version={}",
            assignment.assigned_hub, assignment.device_id, HUB_API_VERSION
        );

        let endpoint = match (&self.settings, password) {
            (_, Some(token)) => Endpoint::with_password(
                assignment.assigned_hub.clone(),
                HUB_PORT,
                assignment.device_id.clone(),
                username,
                token,
            ),
            (ConnectionSettings::Provisioned { tls, .. }, None) => {
                Endpoint::with_client_certificate(
                    assignment.assigned_hub.clone(),
                    HUB_PORT,
                    assignment.device_id.clone(),
                    username,
                    tls.clone(),
                )
            }
            (ConnectionSettings::Legacy { .. }, None) => {
                return Err(TransportError::ConnectionFailed(
                    "legacy session requires a token".to_string(),
                )
                .into());
            }
        };

        let mut hub = self.factory.create();
        hub.connect(endpoint).await?;
        hub.subscribe(
            &command_topic_filter(&assignment.device_id),
            QosLevel::AtLeastOnce,
        )
        .await?;

        info!(hub = %assignment.assigned_hub, "connected to hub");
        self.hub = Some(hub);
        self.state = ManagerState::Connected;
        self.reconnect_armed = true;
        self.reconnect_attempts = 0;
        Ok(())
    }

    /// Route a connection failure: schedule a retry when the reconnect
    /// policy is armed, otherwise fail terminally.
    fn connection_failed(&mut self, error: ConnectError) -> ConnectError {
        warn!(
            "connection attempt failed: {}",
            crate::error::sanitize_log_message(&error.to_string())
        );
        if self.reconnect_armed {
            self.state = ManagerState::Disconnected;
            self.schedule_reconnect();
        } else {
            self.state = ManagerState::Failed;
            self.failure = Some(error.clone());
        }
        error
    }

    /// Schedule the next reconnect attempt with `min(60, 2^n)` backoff, or
    /// give up after the attempt budget is spent.
    fn schedule_reconnect(&mut self) {
        self.reconnect_attempts += 1;
        if self.reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
            error!(
                attempts = MAX_RECONNECT_ATTEMPTS,
                "reconnect attempts exhausted"
            );
            self.state = ManagerState::Failed;
            self.failure = Some(ConnectError::PolicyExhausted {
                attempts: MAX_RECONNECT_ATTEMPTS,
            });
            self.next_reconnect_at = None;
            return;
        }

        let delay = Duration::from_secs(60u64.min(1u64 << self.reconnect_attempts));
        info!(
            attempt = self.reconnect_attempts,
            delay_secs = delay.as_secs(),
            "reconnect scheduled"
        );
        self.next_reconnect_at = Some(Instant::now() + delay);
    }

    /// Publish to the hub, resolving relative topics under the
    /// device-to-cloud path.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retained: bool,
    ) -> Result<(), TransportError> {
        let device_id = self.device_id().ok_or(TransportError::NotConnected)?;
        let hub = self.hub.as_ref().ok_or(TransportError::NotConnected)?;
        hub.publish(&resolve_publish_topic(&device_id, topic), payload, qos, retained)
            .await
    }

    /// Subscribe on the hub, resolving relative topics to the
    /// cloud-to-device command filter.
    pub async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), TransportError> {
        let device_id = self.device_id().ok_or(TransportError::NotConnected)?;
        let hub = self.hub.as_ref().ok_or(TransportError::NotConnected)?;
        hub.subscribe(&resolve_subscribe_topic(&device_id, topic), qos)
            .await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let hub = self.hub.as_ref().ok_or(TransportError::NotConnected)?;
        hub.unsubscribe(topic).await
    }

    /// Pop the next inbound hub message
    pub fn try_recv(&self) -> Option<Message> {
        self.hub.as_ref().and_then(|h| h.try_recv())
    }

    /// Total, idempotent teardown: cancels provisioning if in flight,
    /// disconnects the hub session and disarms the reconnect policy.
    pub async fn disconnect(&mut self) {
        if let Some(mut provisioning) = self.provisioning.take() {
            provisioning.cancel().await;
        }
        if let Some(mut hub) = self.hub.take() {
            let _ = hub.disconnect().await;
        }
        self.state = ManagerState::Disconnected;
        self.assignment = None;
        self.reconnect_armed = false;
        self.reconnect_attempts = 0;
        self.next_reconnect_at = None;
    }
}
