//! # Event Queue
//!
//! Unbounded, thread-safe FIFO of opaque observation events. Producers hold
//! a cloneable [`EventSink`]; the single [`EventQueue`] owner (the batch
//! publisher) is the only component allowed to drain.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Event Queue                                    │
//! │                                                                         │
//! │  scanner thread ──┐                                                     │
//! │  sim feed ────────┼──► EventSink::push ──► [e1, e2, e3, ...] ─┐        │
//! │  any producer ────┘        (non-blocking)                      │        │
//! │                                                                ▼        │
//! │                                     BatchPublisher::drain_all (atomic,  │
//! │                                     FIFO, no loss, no duplication)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Enqueue and drain have no ordering dependency on any other lock; an
//! enqueue racing a drain lands in either that batch or the next one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;

use crate::error::BridgeResult;

// =============================================================================
// Event
// =============================================================================

/// One opaque observation record, immutable once enqueued.
///
/// The pipeline never inspects the fields; it serializes whatever the event
/// source recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct Event(Value);

impl Event {
    /// Records a serializable observation as an opaque event.
    pub fn record<T: Serialize>(observation: &T) -> BridgeResult<Self> {
        Ok(Event(serde_json::to_value(observation)?))
    }

    /// Returns the JSON payload to publish.
    pub fn payload(&self) -> &Value {
        &self.0
    }

    /// Consumes the event, returning its payload.
    pub fn into_payload(self) -> Value {
        self.0
    }
}

impl From<Value> for Event {
    fn from(value: Value) -> Self {
        Event(value)
    }
}

// =============================================================================
// Queue + Sink
// =============================================================================

/// Producer handle for the event queue. Cheap to clone; safe to use from
/// any number of threads.
#[derive(Debug, Clone)]
pub struct EventSink {
    inner: Arc<Mutex<VecDeque<Event>>>,
}

impl EventSink {
    /// Enqueues an event. Non-blocking and always succeeds.
    pub fn push(&self, event: Event) {
        lock(&self.inner).push_back(event);
    }
}

/// Consumer end of the event queue. Owned by exactly one component.
#[derive(Debug)]
pub struct EventQueue {
    inner: Arc<Mutex<VecDeque<Event>>>,
}

impl EventQueue {
    /// Creates an empty queue, returning the producer handle and the
    /// consumer end.
    pub fn new() -> (EventSink, EventQueue) {
        let inner = Arc::new(Mutex::new(VecDeque::new()));
        (
            EventSink {
                inner: inner.clone(),
            },
            EventQueue { inner },
        )
    }

    /// Atomically removes and returns every queued event, in FIFO order.
    ///
    /// An enqueue concurrent with the drain is either included in the
    /// returned batch or left for the next drain; it is never lost and
    /// never returned twice.
    pub fn drain_all(&self) -> Vec<Event> {
        let mut queue = lock(&self.inner);
        std::mem::take(&mut *queue).into()
    }

    /// Number of events currently queued.
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    /// Returns true if no events are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// A poisoned queue mutex only means a producer panicked mid-push; the
// queue contents are still a valid FIFO, so keep going.
fn lock(inner: &Mutex<VecDeque<Event>>) -> MutexGuard<'_, VecDeque<Event>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Tests
// =============================================================================
