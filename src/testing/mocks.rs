//! Mock transport implementation
//!
//! Records everything published and subscribed, lets tests inject inbound
//! messages and script publish/connect outcomes. All state is behind shared
//! handles, so a clone taken before moving the transport into a component
//! keeps full visibility.

use crate::transport::{
    ConnectionState, Endpoint, Message, QosLevel, Transport, TransportError, TransportFactory,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Scriptable in-memory transport
#[derive(Clone, Default)]
pub struct MockTransport {
    connected: Arc<AtomicBool>,
    connect_should_fail: Arc<AtomicBool>,
    connect_count: Arc<AtomicU32>,
    endpoints: Arc<Mutex<Vec<Endpoint>>>,
    published: Arc<Mutex<Vec<Message>>>,
    publish_attempts: Arc<AtomicU32>,
    publish_script: Arc<Mutex<VecDeque<bool>>>,
    subscriptions: Arc<Mutex<Vec<(String, QosLevel)>>>,
    unsubscriptions: Arc<Mutex<Vec<String>>>,
    inbound: Arc<Mutex<VecDeque<Message>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that starts out connected, for components that only
    /// publish
    pub fn connected() -> Self {
        let transport = Self::default();
        transport.connected.store(true, Ordering::SeqCst);
        transport
    }

    /// Make subsequent `connect` calls fail
    pub fn fail_connects(&self, fail: bool) {
        self.connect_should_fail.store(fail, Ordering::SeqCst);
    }

    /// Script the outcome of upcoming publishes; once the script is
    /// exhausted publishes succeed
    pub fn script_publish_results(&self, results: impl IntoIterator<Item = bool>) {
        self.publish_script
            .lock()
            .unwrap()
            .extend(results);
    }

    /// Simulate losing the session
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Queue an inbound message as if the broker delivered it
    pub fn inject(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.inbound.lock().unwrap().push_back(Message {
            topic: topic.into(),
            payload: payload.into(),
            qos: QosLevel::AtLeastOnce,
            retained: false,
        });
    }

    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub fn publish_attempts(&self) -> u32 {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    /// Successfully published messages, in order
    pub fn published(&self) -> Vec<Message> {
        self.published.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, QosLevel)> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.lock().unwrap().clone()
    }

    pub fn clear_history(&self) {
        self.published.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
        self.unsubscriptions.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, endpoint: Endpoint) -> Result<(), TransportError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.endpoints.lock().unwrap().push(endpoint);

        if self.connect_should_fail.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "mock connect failure".to_string(),
            ));
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected("mock disconnected".to_string())
        }
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retained: bool,
    ) -> Result<(), TransportError> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);

        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let scripted_ok = self
            .publish_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(true);
        if !scripted_ok {
            return Err(TransportError::PublishFailed(
                "mock publish failure".to_string(),
            ));
        }

        self.published.lock().unwrap().push(Message {
            topic: topic.to_string(),
            payload,
            qos,
            retained,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.subscriptions
            .lock()
            .unwrap()
            .push((topic.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.unsubscriptions.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    fn try_recv(&self) -> Option<Message> {
        self.inbound.lock().unwrap().pop_front()
    }
}

/// Factory handing out clones of pre-built mock transports.
///
/// Each `create` call returns the next prepared transport (or a fresh
/// default one when the list runs dry) and records a handle so tests can
/// inspect sessions the component created internally.
#[derive(Clone, Default)]
pub struct MockTransportFactory {
    prepared: Arc<Mutex<VecDeque<MockTransport>>>,
    created: Arc<Mutex<Vec<MockTransport>>>,
    fail_all_connects: Arc<AtomicBool>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transport to hand out on the next `create`
    pub fn prepare(&self, transport: MockTransport) {
        self.prepared.lock().unwrap().push_back(transport);
    }

    /// Every transport created from now on refuses to connect
    pub fn fail_all_connects(&self, fail: bool) {
        self.fail_all_connects.store(fail, Ordering::SeqCst);
    }

    /// Handles to every transport handed out so far, in creation order
    pub fn created(&self) -> Vec<MockTransport> {
        self.created.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl TransportFactory for MockTransportFactory {
    type Transport = MockTransport;

    fn create(&self) -> MockTransport {
        let transport = self
            .prepared
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        if self.fail_all_connects.load(Ordering::SeqCst) {
            transport.fail_connects(true);
        }
        self.created.lock().unwrap().push(transport.clone());
        transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_publishes() {
        let mut transport = MockTransport::new();
        transport
            .connect(Endpoint::with_password("h", 8883, "c", "u", "p"))
            .await
            .unwrap();

        transport
            .publish("topic", b"payload".to_vec(), QosLevel::AtLeastOnce, false)
            .await
            .unwrap();

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "topic");
    }

    #[tokio::test]
    async fn test_scripted_publish_failures() {
        let transport = MockTransport::connected();
        transport.script_publish_results([false, true]);

        assert!(transport
            .publish("t", Vec::new(), QosLevel::AtMostOnce, false)
            .await
            .is_err());
        assert!(transport
            .publish("t", Vec::new(), QosLevel::AtMostOnce, false)
            .await
            .is_ok());
        assert_eq!(transport.publish_attempts(), 2);
        assert_eq!(transport.published().len(), 1);
    }

    #[tokio::test]
    async fn test_inject_and_try_recv() {
        let transport = MockTransport::new();
        transport.inject("a/topic", b"{}".to_vec());

        let message = transport.try_recv().unwrap();
        assert_eq!(message.topic, "a/topic");
        assert!(transport.try_recv().is_none());
    }

    #[test]
    fn test_factory_hands_out_prepared_transports() {
        let factory = MockTransportFactory::new();
        let prepared = MockTransport::new();
        prepared.inject("marker", Vec::new());
        factory.prepare(prepared);

        let first = factory.create();
        assert!(first.try_recv().is_some());

        let second = factory.create();
        assert!(second.try_recv().is_none());
        assert_eq!(factory.created_count(), 2);
    }
}
