//! Telemetry pipeline: events in, at-least-once publishes out
//!
//! Subscribes to every event type on the bus; the subscription feeds an
//! inbox the pipeline drains on each `process_events` tick. Events pass the
//! reporting policy, are serialized to the wire format and published at
//! QoS 1. Failed publishes enter a bounded retry queue; only the head entry
//! is retried per tick so delivery order is preserved.

use super::bus::EventBus;
use super::event::{Event, EventFactory, EventType, TelemetrySnapshot};
use super::policy::PolicyEngine;
use crate::connection::telemetry_topic;
use crate::transport::{QosLevel, Transport};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Retry queue bound; the oldest entry is dropped to admit a new one
pub const RETRY_QUEUE_CAPACITY: usize = 100;

/// A message awaiting redelivery
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub event: Event,
    pub topic: String,
    pub payload: String,
    pub attempts: u32,
    pub next_retry_at: Instant,
}

pub struct TelemetryPipeline {
    bus: Arc<EventBus>,
    factory: Arc<EventFactory>,
    policies: PolicyEngine,
    inbox: Arc<Mutex<VecDeque<Event>>>,
    retry_queue: VecDeque<PendingMessage>,
    running: bool,
    last_heartbeat: Instant,
    in_motion: bool,
    last_reported_battery_pct: f64,
}

impl TelemetryPipeline {
    pub fn new(bus: Arc<EventBus>, factory: Arc<EventFactory>, policies: PolicyEngine) -> Self {
        Self {
            bus,
            factory,
            policies,
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            retry_queue: VecDeque::new(),
            running: false,
            last_heartbeat: Instant::now(),
            in_motion: false,
            last_reported_battery_pct: 100.0,
        }
    }

    /// Subscribe to the bus and start the heartbeat schedule
    pub fn start(&mut self) {
        if self.running {
            return;
        }

        let inbox = self.inbox.clone();
        self.bus.subscribe_all(move |event| {
            inbox
                .lock()
                .expect("pipeline inbox lock poisoned")
                .push_back(event.clone());
        });

        self.running = true;
        self.last_heartbeat = Instant::now();
    }

    /// Stop publishing and discard outstanding retries
    pub fn stop(&mut self) {
        self.running = false;
        self.retry_queue.clear();
        self.inbox
            .lock()
            .expect("pipeline inbox lock poisoned")
            .clear();
    }

    pub fn retry_queue_len(&self) -> usize {
        self.retry_queue.len()
    }

    /// Replace the heartbeat cadence (cloud `setHeartbeatSeconds` command)
    pub fn set_heartbeat_seconds(&mut self, seconds: u64) {
        self.policies.reporting.moving_heartbeat = std::time::Duration::from_secs(seconds);
        self.policies.reporting.stationary_heartbeat =
            std::time::Duration::from_secs(seconds * 5);
    }

    /// One tick: retry due messages, schedule the heartbeat, drain the inbox
    pub async fn process_events<T: Transport>(
        &mut self,
        transport: Option<&T>,
        snapshot: &TelemetrySnapshot,
    ) {
        if !self.running {
            return;
        }

        if let Some(transport) = transport {
            self.retry_due_messages(transport).await;
        }

        let interval = self.policies.reporting.heartbeat_interval(self.in_motion);
        if self.last_heartbeat.elapsed() >= interval {
            self.last_heartbeat = Instant::now();
            let heartbeat = self.factory.create(EventType::Heartbeat, snapshot);
            // Through the bus so other observers see the heartbeat too; it
            // lands back in the inbox within this same tick's dispatch
            self.bus.publish(heartbeat);
            self.bus.process_events();
        }

        loop {
            let event = self
                .inbox
                .lock()
                .expect("pipeline inbox lock poisoned")
                .pop_front();
            let Some(event) = event else { break };
            self.handle_event(transport, event).await;
        }
    }

    async fn handle_event<T: Transport>(&mut self, transport: Option<&T>, event: Event) {
        let publish = self.should_publish(&event);

        // Track motion for the heartbeat cadence regardless of gating
        match event.event_type {
            EventType::MotionStart => self.in_motion = true,
            EventType::MotionStop => self.in_motion = false,
            _ => {}
        }

        if !publish {
            debug!(event_type = %event.event_type, "event gated by reporting policy");
            return;
        }

        if event.event_type == EventType::LowBattery {
            self.last_reported_battery_pct = event.battery.pct as f64;
        }

        let topic = telemetry_topic(&event.device_id);
        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to serialize event: {e}");
                return;
            }
        };

        let delivered = match transport {
            Some(transport) if transport.is_connected() => transport
                .publish(
                    &topic,
                    payload.clone().into_bytes(),
                    QosLevel::AtLeastOnce,
                    false,
                )
                .await
                .is_ok(),
            _ => false,
        };

        if !delivered {
            self.enqueue_retry(event, topic, payload);
        }
    }

    /// Queue a failed publish for redelivery with backoff
    fn enqueue_retry(&mut self, event: Event, topic: String, payload: String) {
        if self.retry_queue.len() >= RETRY_QUEUE_CAPACITY {
            if let Some(dropped) = self.retry_queue.pop_front() {
                warn!(
                    seq = dropped.event.sequence,
                    "retry queue full, dropped oldest entry"
                );
            }
        }

        let attempts = 1;
        self.retry_queue.push_back(PendingMessage {
            event,
            topic,
            payload,
            attempts,
            next_retry_at: Instant::now() + self.policies.retry.backoff(attempts),
        });
    }

    /// Attempt the head retry entry when due. Success pops and continues;
    /// failure reschedules and ends the pass so order is preserved.
    async fn retry_due_messages<T: Transport>(&mut self, transport: &T) {
        if !transport.is_connected() {
            return;
        }

        let now = Instant::now();
        while let Some(head) = self.retry_queue.front_mut() {
            if head.next_retry_at > now {
                break;
            }

            if !self.policies.retry.should_retry(head.attempts) {
                warn!(
                    seq = head.event.sequence,
                    attempts = head.attempts,
                    "dropping message, retry budget spent"
                );
                self.retry_queue.pop_front();
                continue;
            }

            let delivered = transport
                .publish(
                    &head.topic,
                    head.payload.clone().into_bytes(),
                    QosLevel::AtLeastOnce,
                    false,
                )
                .await
                .is_ok();

            if delivered {
                self.retry_queue.pop_front();
            } else {
                head.attempts += 1;
                head.next_retry_at = now + self.policies.retry.backoff(head.attempts);
                break;
            }
        }
    }

    /// Reporting-policy gate
    fn should_publish(&self, event: &Event) -> bool {
        match event.event_type {
            EventType::Heartbeat => true,
            EventType::MotionStart | EventType::MotionStop => {
                self.policies.reporting.should_report_motion_change()
            }
            EventType::LowBattery => self.policies.reporting.should_report_battery(
                event.battery.pct as f64,
                self.last_reported_battery_pct,
            ),
            _ => true,
        }
    }
}
