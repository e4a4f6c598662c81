//! Run-lifecycle event bus.
//!
//! Every loop iteration emits events onto a shared `tokio::sync::broadcast`
//! channel (`EventBus`). The `EventLogger` subscribes for the lifetime of the
//! process and persists each run's events to
//! `<project>/.ralphx/runs/<run_id>/events.jsonl`. Other consumers (a future
//! `serve` SSE relay, `doctor`) can subscribe independently.
//!
//! ```rust,ignore
//! let bus = Arc::new(EventBus::with_default_capacity());
//! let emitter = bus.emitter_for(run_id);
//! emitter.iteration_started(1, "implement");
//! ```

mod bus;
mod logger;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter, create_event_bus};
pub use logger::{EventLogger, read_run_events, spawn_event_logger};
pub use types::{EventLogEntry, IterationOutcome, RunEvent};
