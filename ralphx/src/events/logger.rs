//! Event Logger - persists run events to per-run JSONL files.
//!
//! Subscribes to the `EventBus` and writes every event to
//! `<project>/.ralphx/runs/<run_id>/events.jsonl` — one append-only JSONL
//! file per run, scoped under the project directory rather than a global
//! run-log location.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use super::bus::EventBus;
use super::types::{EventLogEntry, RunEvent};

pub struct EventLogger {
    runs_dir: PathBuf,
    writers: HashMap<String, BufWriter<File>>,
}

impl EventLogger {
    pub fn new(runs_dir: impl AsRef<Path>) -> Self {
        let runs_dir = runs_dir.as_ref().to_path_buf();
        debug!(?runs_dir, "EventLogger::new: creating logger");
        Self { runs_dir, writers: HashMap::new() }
    }

    pub fn for_project(project_root: impl AsRef<Path>) -> eyre::Result<Self> {
        let runs_dir = project_root.as_ref().join(".ralphx").join("runs");
        fs::create_dir_all(&runs_dir)?;
        Ok(Self::new(runs_dir))
    }

    pub fn write_event(&mut self, event: &RunEvent) -> eyre::Result<()> {
        let run_id = event.run_id().to_string();
        debug!(%run_id, event_type = event.event_type(), "EventLogger::write_event");

        let writer = if let Some(w) = self.writers.get_mut(&run_id) {
            w
        } else {
            let run_dir = self.runs_dir.join(&run_id);
            fs::create_dir_all(&run_dir)?;
            let log_path = run_dir.join("events.jsonl");
            debug!(?log_path, "EventLogger: creating new log file");
            let file = OpenOptions::new().create(true).append(true).open(&log_path)?;
            self.writers.insert(run_id.clone(), BufWriter::new(file));
            self.writers.get_mut(&run_id).unwrap()
        };

        let entry = EventLogEntry::new(event);
        let json = serde_json::to_string(&entry)?;
        writeln!(writer, "{json}")?;
        writer.flush()?;
        Ok(())
    }

    pub fn close_run(&mut self, run_id: &str) {
        debug!(%run_id, "EventLogger::close_run");
        if let Some(mut writer) = self.writers.remove(run_id) {
            let _ = writer.flush();
        }
    }

    /// Consumes events from the bus until it's closed. Meant to be spawned
    /// as a background task for the lifetime of the process.
    pub async fn run(mut self, event_bus: Arc<EventBus>) {
        debug!("EventLogger::run: starting event logger");
        let mut rx = event_bus.subscribe();

        loop {
            match rx.recv().await {
                Ok(event) => {
                    let run_id = event.run_id().to_string();
                    let run_finished = matches!(event, RunEvent::RunStateChanged { ref status, .. } if status == "completed" || status == "aborted" || status == "error");

                    if let Err(e) = self.write_event(&event) {
                        error!(%run_id, error = %e, "EventLogger: failed to write event");
                    }

                    if run_finished {
                        self.close_run(&run_id);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "EventLogger: lagged behind, missed events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("EventLogger: channel closed, shutting down");
                    break;
                }
            }
        }

        for (run_id, mut writer) in self.writers.drain() {
            debug!(%run_id, "EventLogger: flushing writer on shutdown");
            let _ = writer.flush();
        }
    }
}

/// Reads a run's persisted events back from its JSONL log.
pub fn read_run_events(project_root: impl AsRef<Path>, run_id: &str) -> eyre::Result<Vec<EventLogEntry>> {
    let log_path = project_root.as_ref().join(".ralphx").join("runs").join(run_id).join("events.jsonl");
    debug!(?log_path, "read_run_events: reading log file");

    if !log_path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(&log_path)?;
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventLogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(line, error = %e, "read_run_events: failed to parse line"),
        }
    }
    debug!(count = entries.len(), "read_run_events: loaded entries");
    Ok(entries)
}

pub fn spawn_event_logger(project_root: impl AsRef<Path>, event_bus: Arc<EventBus>) -> eyre::Result<tokio::task::JoinHandle<()>> {
    let logger = EventLogger::for_project(project_root)?;
    Ok(tokio::spawn(async move {
        logger.run(event_bus).await;
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::IterationOutcome;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips_events() {
        let dir = tempdir().unwrap();
        let mut logger = EventLogger::for_project(dir.path()).unwrap();
        logger.write_event(&RunEvent::IterationStarted { run_id: "run-1".into(), iteration: 1, mode: "implement".into() }).unwrap();
        logger
            .write_event(&RunEvent::IterationCompleted { run_id: "run-1".into(), iteration: 1, outcome: IterationOutcome::Success })
            .unwrap();
        logger.close_run("run-1");

        let entries = read_run_events(dir.path(), "run-1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event_type, "iteration_started");
        assert_eq!(entries[1].event_type, "iteration_completed");
    }

    #[test]
    fn read_missing_run_returns_empty() {
        let dir = tempdir().unwrap();
        let entries = read_run_events(dir.path(), "no-such-run").unwrap();
        assert!(entries.is_empty());
    }
}
