//! Event vocabulary for the run-lifecycle event bus.
//!
//! The run-lifecycle and adapter-stream events this component actually
//! produces (§4.5 step 4, §5 "Ordering guarantees").

use serde::{Deserialize, Serialize};

use crate::llm::StreamEvent;

/// Outcome of a single loop iteration, recorded on `IterationCompleted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IterationOutcome {
    Success,
    /// No claimable item was found; the iteration counter was not incremented (§4.5 step 5).
    NoOp,
    Failed { reason: String },
}

/// A run-scoped event. Every variant carries `run_id` so a single broadcast
/// channel can multiplex events from many concurrently active runs.
#[derive(Debug, Clone)]
pub enum RunEvent {
    IterationStarted { run_id: String, iteration: i64, mode: String },
    Heartbeat { run_id: String, iteration: i64 },
    /// One event forwarded verbatim from the LLM adapter's stream (§4.2).
    Stream { run_id: String, iteration: i64, event: StreamEvent },
    IterationCompleted { run_id: String, iteration: i64, outcome: IterationOutcome },
    Error { run_id: String, message: String, code: String },
    RunStateChanged { run_id: String, status: String },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::IterationStarted { run_id, .. }
            | RunEvent::Heartbeat { run_id, .. }
            | RunEvent::Stream { run_id, .. }
            | RunEvent::IterationCompleted { run_id, .. }
            | RunEvent::Error { run_id, .. }
            | RunEvent::RunStateChanged { run_id, .. } => run_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            RunEvent::IterationStarted { .. } => "iteration_started",
            RunEvent::Heartbeat { .. } => "heartbeat",
            RunEvent::Stream { .. } => "stream",
            RunEvent::IterationCompleted { .. } => "iteration_completed",
            RunEvent::Error { .. } => "error",
            RunEvent::RunStateChanged { .. } => "run_state_changed",
        }
    }
}

/// A `RunEvent` persisted with a wall-clock timestamp, for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub run_id: String,
    pub event_type: String,
    pub message: String,
}

impl EventLogEntry {
    pub fn new(event: &RunEvent) -> Self {
        let message = match event {
            RunEvent::IterationStarted { iteration, mode, .. } => format!("iteration {iteration} started (mode={mode})"),
            RunEvent::Heartbeat { iteration, .. } => format!("heartbeat at iteration {iteration}"),
            RunEvent::Stream { event, .. } => format!("{event:?}"),
            RunEvent::IterationCompleted { iteration, outcome, .. } => format!("iteration {iteration} completed: {outcome:?}"),
            RunEvent::Error { message, code, .. } => format!("[{code}] {message}"),
            RunEvent::RunStateChanged { status, .. } => format!("run status -> {status}"),
        };
        Self { timestamp: chrono::Utc::now(), run_id: event.run_id().to_string(), event_type: event.event_type().to_string(), message }
    }
}
