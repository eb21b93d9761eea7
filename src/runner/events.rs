//! Typed run-timeline events and the bounded event bus.
//!
//! Events are telemetry, not commitments: producers never block, and a
//! full bus drops silently.  With the default capacity of 100 against a
//! sampling interval of a second or more, drops only occur under
//! pathological event rates.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

pub const EVENT_BUS_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Phase,
    Ramp,
    IfaceStart,
    IfaceStop,
    Custom,
}

/// A marker on the run timeline, attached to the next emitted data point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Cloneable producer handle.  Held by phase transitions, interface
/// supervisors, ramp controllers, and the marker intake.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
}

impl EventSender {
    /// Enqueue an event; never blocks, drops when the bus is full.
    pub fn publish(&self, kind: EventType, message: impl Into<String>) {
        let event = Event {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        };
        if self.tx.try_send(event).is_err() {
            debug!("event bus full, dropping event");
        }
    }
}

/// Bounded event channel plus the drain task that accumulates pending
/// events between sampling ticks.  Owned by the runner for one run.
pub struct EventBus {
    tx: mpsc::Sender<Event>,
    pending: Arc<Mutex<Vec<Event>>>,
    drain: tokio::task::JoinHandle<()>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(EVENT_BUS_CAPACITY);
        let pending = Arc::new(Mutex::new(Vec::new()));

        let drain = tokio::spawn({
            let pending = Arc::clone(&pending);
            async move {
                while let Some(event) = rx.recv().await {
                    pending.lock().unwrap().push(event);
                }
            }
        });

        Self { tx, pending, drain }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    /// Swap out everything enqueued since the previous take, in enqueue
    /// order.  Called once per sampling tick.
    pub fn take_pending(&self) -> Vec<Event> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }

    /// Stop draining.  Events published after this point go nowhere.
    pub fn close(self) {
        self.drain.abort();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let bus = EventBus::new();
        let sender = bus.sender();

        sender.publish(EventType::Phase, "first");
        sender.publish(EventType::Ramp, "second");
        sender.publish(EventType::Custom, "third");

        // Give the drain task a moment to pull them through.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = bus.take_pending();
        let messages: Vec<_> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_take_is_destructive() {
        let bus = EventBus::new();
        bus.sender().publish(EventType::Custom, "once");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(bus.take_pending().len(), 1);
        assert!(bus.take_pending().is_empty());
    }

    #[tokio::test]
    async fn test_full_bus_drops_instead_of_blocking() {
        let bus = EventBus::new();
        let sender = bus.sender();

        // Stall the drain by flooding faster than it can be scheduled:
        // publish well past capacity synchronously.
        for i in 0..(EVENT_BUS_CAPACITY * 3) {
            sender.publish(EventType::Custom, format!("event-{}", i));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let events = bus.take_pending();
        // Some were dropped, none blocked, order preserved.
        assert!(!events.is_empty());
        assert!(events.len() <= EVENT_BUS_CAPACITY * 3);
        for window in events.windows(2) {
            let a: usize = window[0].message["event-".len()..].parse().unwrap();
            let b: usize = window[1].message["event-".len()..].parse().unwrap();
            assert!(a < b);
        }
    }
}
