//! Event Bus - central pub/sub system for run-lifecycle events.
//!
//! Uses a `tokio::sync::broadcast` channel so every subscriber (a logger, a
//! future HTTP collaborator's SSE relay) receives run events with minimal
//! latency: a broadcast channel over `RunEvent` values (§4.5, §5), cloned
//! once per subscriber rather than routed through a mailbox-per-listener.

use tokio::sync::broadcast;
use tracing::debug;

use super::types::{IterationOutcome, RunEvent};
use crate::llm::StreamEvent;

/// At ~100 events/second, this provides roughly 100 seconds of buffer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Central event bus for run activity.
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
    #[allow(dead_code)]
    channel_capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, channel_capacity: capacity }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Fire-and-forget: if there are no subscribers, the event is dropped.
    pub fn emit(&self, event: RunEvent) {
        debug!(event_type = event.event_type(), run_id = event.run_id(), "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    /// Creates an emitter bound to one run, with convenience methods for
    /// each event kind.
    pub fn emitter_for(&self, run_id: impl Into<String>) -> EventEmitter {
        let run_id = run_id.into();
        debug!(%run_id, "EventBus::emitter_for: creating emitter");
        EventEmitter { tx: self.tx.clone(), run_id }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

pub fn create_event_bus() -> EventBus {
    EventBus::with_default_capacity()
}

/// Cheap-to-clone handle for emitting events pre-bound to one run's ID.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<RunEvent>,
    run_id: String,
}

impl EventEmitter {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn emit(&self, event: RunEvent) {
        debug!(event_type = event.event_type(), "EventEmitter::emit");
        let _ = self.tx.send(event);
    }

    pub fn iteration_started(&self, iteration: i64, mode: &str) {
        self.emit(RunEvent::IterationStarted { run_id: self.run_id.clone(), iteration, mode: mode.to_string() });
    }

    pub fn heartbeat(&self, iteration: i64) {
        self.emit(RunEvent::Heartbeat { run_id: self.run_id.clone(), iteration });
    }

    pub fn stream(&self, iteration: i64, event: StreamEvent) {
        self.emit(RunEvent::Stream { run_id: self.run_id.clone(), iteration, event });
    }

    pub fn iteration_completed(&self, iteration: i64, outcome: IterationOutcome) {
        self.emit(RunEvent::IterationCompleted { run_id: self.run_id.clone(), iteration, outcome });
    }

    pub fn error(&self, message: impl Into<String>, code: impl Into<String>) {
        self.emit(RunEvent::Error { run_id: self.run_id.clone(), message: message.into(), code: code.into() });
    }

    pub fn run_state_changed(&self, status: &str) {
        self.emit(RunEvent::RunStateChanged { run_id: self.run_id.clone(), status: status.to_string() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let emitter = bus.emitter_for("run-1");

        emitter.iteration_started(1, "implement");
        emitter.iteration_completed(1, IterationOutcome::Success);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type(), "iteration_started");
        assert_eq!(first.run_id(), "run-1");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.event_type(), "iteration_completed");
    }

    #[tokio::test]
    async fn events_are_isolated_per_subscriber_but_shared_bus() {
        let bus = EventBus::new(16);
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();
        bus.emitter_for("run-1").heartbeat(3);

        assert_eq!(rx_a.recv().await.unwrap().event_type(), "heartbeat");
        assert_eq!(rx_b.recv().await.unwrap().event_type(), "heartbeat");
    }

    #[test]
    fn default_channel_capacity_is_ten_thousand() {
        assert_eq!(DEFAULT_CHANNEL_CAPACITY, 10_000);
    }

    #[test]
    fn bus_default_has_no_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
