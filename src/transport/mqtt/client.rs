//! I/O coordination for the MQTT transport
//!
//! Wraps a rumqttc `AsyncClient`/`EventLoop` pair. The event loop runs in a
//! spawned task; connection state flows through a `watch` channel and inbound
//! messages through a bounded queue the upper layers drain with `try_recv`.
//! A transport instance is single-shot: once the session drops, the event
//! loop ends and the state parks at `Disconnected`.

use super::connection::{
    apply_system_properties, configure_mqtt_options, ConnectionState, OfflineQueue,
    PendingPublish, CONNECT_TIMEOUT,
};
use crate::transport::{
    Credentials, Endpoint, Message, QosLevel, Transport, TransportError, TransportFactory,
};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Packet, QoS};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How many inbound messages may sit unread before the oldest is dropped
const INBOUND_QUEUE_CAPACITY: usize = 256;

fn to_rumqttc_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn from_rumqttc_qos(qos: QoS) -> QosLevel {
    match qos {
        QoS::AtMostOnce => QosLevel::AtMostOnce,
        QoS::AtLeastOnce => QosLevel::AtLeastOnce,
        QoS::ExactlyOnce => QosLevel::ExactlyOnce,
    }
}

/// MQTT/TLS transport backed by rumqttc
pub struct MqttTransport {
    client: Arc<Mutex<Option<AsyncClient>>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    inbound: Arc<Mutex<VecDeque<Message>>>,
    offline: Arc<Mutex<OfflineQueue>>,
    event_loop_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttTransport {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        Self {
            client: Arc::new(Mutex::new(None)),
            state_tx,
            state_rx,
            inbound: Arc::new(Mutex::new(VecDeque::new())),
            offline: Arc::new(Mutex::new(OfflineQueue::new())),
            event_loop_handle: None,
            shutdown_tx: None,
        }
    }

    fn current_client(&self) -> Option<AsyncClient> {
        self.client.lock().expect("client lock poisoned").clone()
    }

    /// Wait for the broker acknowledgment, or fail within the timeout
    async fn wait_for_connack(
        mut state_rx: watch::Receiver<ConnectionState>,
    ) -> Result<(), TransportError> {
        let wait = tokio::time::timeout(CONNECT_TIMEOUT, async {
            loop {
                match &*state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason) => {
                        return Err(TransportError::ConnectionFailed(reason.clone()));
                    }
                    ConnectionState::Idle | ConnectionState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::ConnectionFailed(
                        "state channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match wait {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnackTimeout(CONNECT_TIMEOUT)),
        }
    }

    /// Publish through the rumqttc client, applying the telemetry topic
    /// rewrite in one place so queued and direct publishes behave the same.
    async fn publish_now(
        client: &AsyncClient,
        message: PendingPublish,
    ) -> Result<(), TransportError> {
        let topic = apply_system_properties(&message.topic);
        client
            .publish(
                topic,
                to_rumqttc_qos(message.qos),
                message.retained,
                message.payload,
            )
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))
    }

    /// Drain the offline queue in FIFO order after a session comes up
    async fn drain_offline_queue(client: &AsyncClient, offline: &Arc<Mutex<OfflineQueue>>) {
        loop {
            let next = offline.lock().expect("offline queue lock poisoned").pop();
            let Some(message) = next else { break };

            if let Err(e) = Self::publish_now(client, message).await {
                warn!("failed to flush queued message: {e}");
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self, endpoint: Endpoint) -> Result<(), TransportError> {
        if self.event_loop_handle.is_some() {
            return Err(TransportError::ConnectionFailed(
                "transport already used; create a fresh instance".to_string(),
            ));
        }

        if let Credentials::ClientCertificate { identity, .. } = &endpoint.credentials {
            identity.validate()?;
        }

        let options = configure_mqtt_options(&endpoint)?;
        let (client, mut event_loop) = AsyncClient::new(options, 10);

        *self.client.lock().expect("client lock poisoned") = Some(client.clone());
        let _ = self.state_tx.send(ConnectionState::Connecting);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let state_tx = self.state_tx.clone();
        let inbound = self.inbound.clone();
        let offline = self.offline.clone();
        let host = endpoint.host.clone();

        let handle = tokio::spawn(async move {
            debug!(host = %host, "MQTT event loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            let _ = state_tx
                                .send(ConnectionState::Disconnected("client disconnect".into()));
                            break;
                        }
                    }
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!(host = %host, "MQTT session established");
                            let _ = state_tx.send(ConnectionState::Connected);
                            Self::drain_offline_queue(&client, &offline).await;
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let message = Message {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                                qos: from_rumqttc_qos(publish.qos),
                                retained: publish.retain,
                            };
                            let mut queue = inbound.lock().expect("inbound lock poisoned");
                            if queue.len() >= INBOUND_QUEUE_CAPACITY {
                                queue.pop_front();
                            }
                            queue.push_back(message);
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            warn!(host = %host, "broker closed the session");
                            let _ = state_tx.send(ConnectionState::Disconnected(
                                "broker disconnect".into(),
                            ));
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let _ = state_tx
                                .send(ConnectionState::Disconnected(e.to_string()));
                            break;
                        }
                    }
                }
            }
            debug!(host = %host, "MQTT event loop stopped");
        });
        self.event_loop_handle = Some(handle);

        Self::wait_for_connack(self.state_rx.clone()).await
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        if let Some(client) = self.current_client() {
            // Best effort; the session may already be gone
            let _ = client.disconnect().await;
        }

        let _ = self
            .state_tx
            .send(ConnectionState::Disconnected("client disconnect".into()));

        if let Some(handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(std::time::Duration::from_secs(2), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("event loop task ended with error: {e}");
                }
                Err(_) => {
                    warn!("event loop task did not stop in time, aborting");
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        matches!(*self.state_rx.borrow(), ConnectionState::Connected)
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retained: bool,
    ) -> Result<(), TransportError> {
        let message = PendingPublish {
            topic: topic.to_string(),
            payload,
            qos,
            retained,
        };

        if !self.is_connected() {
            let dropped = self
                .offline
                .lock()
                .expect("offline queue lock poisoned")
                .push(message);
            if let Some(old) = dropped {
                debug!(topic = %old.topic, "offline queue full, dropped oldest message");
            }
            return Err(TransportError::NotConnected);
        }

        let client = self.current_client().ok_or(TransportError::NotConnected)?;
        Self::publish_now(&client, message).await
    }

    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let client = self.current_client().ok_or(TransportError::NotConnected)?;
        client
            .subscribe(topic, to_rumqttc_qos(qos))
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let client = self.current_client().ok_or(TransportError::NotConnected)?;
        client
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))
    }

    fn try_recv(&self) -> Option<Message> {
        self.inbound
            .lock()
            .expect("inbound lock poisoned")
            .pop_front()
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

/// Factory producing fresh single-shot MQTT transports
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttTransportFactory;

impl TransportFactory for MqttTransportFactory {
    type Transport = MqttTransport;

    fn create(&self) -> MqttTransport {
        MqttTransport::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transport_is_idle() {
        let transport = MqttTransport::new();
        assert_eq!(transport.connection_state(), ConnectionState::Idle);
        assert!(!transport.is_connected());
        assert!(transport.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_queues_and_reports() {
        let transport = MqttTransport::new();

        let result = transport
            .publish("devices/d/messages/events/", b"{}".to_vec(), QosLevel::AtLeastOnce, false)
            .await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
        assert_eq!(transport.offline.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_queue_bound_holds_for_transport() {
        use super::super::OFFLINE_QUEUE_CAPACITY;
        let transport = MqttTransport::new();

        for i in 0..=OFFLINE_QUEUE_CAPACITY {
            let _ = transport
                .publish(&format!("t{i}"), Vec::new(), QosLevel::AtMostOnce, false)
                .await;
        }

        let mut queue = transport.offline.lock().unwrap();
        assert_eq!(queue.len(), OFFLINE_QUEUE_CAPACITY);
        // Entry 0 was evicted by the 101st publish
        assert_eq!(queue.pop().unwrap().topic, "t1");
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let transport = MqttTransport::new();
        let result = transport.subscribe("topic", QosLevel::AtLeastOnce).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_ok() {
        let mut transport = MqttTransport::new();
        assert!(transport.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connack_reports_disconnect_reason() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            let _ = state_tx.send(ConnectionState::Disconnected("refused".into()));
        });

        let result = MqttTransport::wait_for_connack(state_rx).await;
        match result {
            Err(TransportError::ConnectionFailed(reason)) => assert_eq!(reason, "refused"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
