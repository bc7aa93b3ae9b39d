//! In-process event bus decoupling the state machine from the telemetry
//! pipeline and other observers
//!
//! Publishing enqueues under a lock; `process_events` drains the queue and
//! invokes subscribers in subscription order. Delivery order equals publish
//! order. Reentrant processing is rejected, and a panicking handler does not
//! stop delivery to the remaining handlers.

use super::event::{Event, EventType};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::warn;

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Mutex-guarded publish/subscribe queue
#[derive(Default)]
pub struct EventBus {
    queue: Mutex<VecDeque<Event>>,
    handlers: RwLock<HashMap<EventType, Vec<Handler>>>,
    processing: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an event for the next `process_events` pass
    pub fn publish(&self, event: Event) {
        self.queue
            .lock()
            .expect("event queue lock poisoned")
            .push_back(event);
    }

    /// Register a handler for one event type. Handlers run in subscription
    /// order during `process_events`.
    pub fn subscribe(
        &self,
        event_type: EventType,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) {
        self.handlers
            .write()
            .expect("handlers lock poisoned")
            .entry(event_type)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register one handler for every event type
    pub fn subscribe_all(&self, handler: impl Fn(&Event) + Send + Sync + 'static) {
        let shared: Handler = Arc::new(handler);
        let mut handlers = self.handlers.write().expect("handlers lock poisoned");
        for event_type in EventType::ALL {
            handlers.entry(event_type).or_default().push(shared.clone());
        }
    }

    /// Drain the queue, dispatching each event to its subscribers. Returns
    /// the number of events delivered. Reentrant calls return immediately.
    pub fn process_events(&self) -> usize {
        if self.processing.swap(true, Ordering::SeqCst) {
            return 0;
        }

        let mut delivered = 0;
        loop {
            let event = {
                let mut queue = self.queue.lock().expect("event queue lock poisoned");
                match queue.pop_front() {
                    Some(event) => event,
                    None => break,
                }
            };

            let handlers = {
                let map = self.handlers.read().expect("handlers lock poisoned");
                map.get(&event.event_type).cloned().unwrap_or_default()
            };

            for handler in handlers {
                if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                    warn!(event_type = %event.event_type, "event handler panicked");
                }
            }
            delivered += 1;
        }

        self.processing.store(false, Ordering::SeqCst);
        delivered
    }

    /// Number of events waiting for dispatch
    pub fn pending(&self) -> usize {
        self.queue.lock().expect("event queue lock poisoned").len()
    }
}
