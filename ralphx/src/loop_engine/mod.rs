//! Loop Executor (§4.5): per-iteration scheduling — mode selection, prompt
//! build, adapter invocation, event emission, item extraction/completion,
//! cooldown, limit checks, and cooperative pause/stop.
//!
//! Ported from `core/executor.py`'s main iteration loop (the
//! no-op-decrements-the-counter rule, the consecutive-errors/iteration/
//! runtime limit checks, and the claim-then-build-then-execute-then-extract
//! sequencing), reimplemented with `tokio` tasks and channels in place of
//! `asyncio`.

mod extract;
mod select;

pub use extract::{ExtractedItem, extract_work_items, is_known_field};
pub use select::{ModeSelectorState, SelectError, select_mode};

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use projectstore::{NewWorkItem, ProjectStore, RunPatch, RunStatus, Session, StoreError, WorkItemStatus};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::claim::{ClaimEngine, ClaimError, DEFAULT_STALE_CLAIM_MAX_AGE};
use crate::domain::{LoopConfig, LoopType};
use crate::events::{EventEmitter, IterationOutcome as EventIterationOutcome};
use crate::llm::{ExecuteRequest, LlmAdapter, StopSignal};
use crate::prompt::{InjectableResource, PromptContext, build_prompt, load_template};
use crate::resources::{ResourceError, ResourceManager};

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("claim error: {0}")]
    Claim(#[from] ClaimError),
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),
}

pub type LoopResult<T> = Result<T, LoopError>;

/// Why a run stopped reaching `completed` (§4.5 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxIterations,
    MaxRuntime,
    MaxConsecutiveErrors,
}

impl StopReason {
    fn message(self, limits: &crate::domain::Limits) -> String {
        match self {
            StopReason::MaxIterations => format!("max_iterations reached ({})", limits.max_iterations),
            StopReason::MaxRuntime => format!("max_runtime_seconds reached ({})", limits.max_runtime_seconds),
            StopReason::MaxConsecutiveErrors => {
                format!("max_consecutive_errors reached ({})", limits.max_consecutive_errors)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(StopReason),
    Aborted,
    Error(String),
}

/// Cooperative pause/resume gate (§4.5 "pause()/resume() are idempotent").
/// A `watch` channel (rather than `Notify`) so a `resume()` that races a
/// not-yet-waiting executor is never lost — `changed()` always observes the
/// latest value instead of depending on a wakeup landing while someone is
/// subscribed.
#[derive(Clone)]
pub struct PauseGate {
    tx: Arc<watch::Sender<bool>>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self) {
        let _ = self.tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    async fn wait_while_paused(&self) {
        let mut rx = self.subscribe();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-run executor state, owned by whoever drives `run_to_completion`.
pub struct LoopExecutor<'a> {
    store: &'a ProjectStore,
    resources: ResourceManager<'a>,
    config: LoopConfig,
    project_root: PathBuf,
    project_slug: String,
    adapter: Arc<dyn LlmAdapter>,
    events: EventEmitter,
    stop: StopSignal,
    pause: PauseGate,
    account_id: Option<String>,
    settings_path: Option<PathBuf>,

    run_id: String,
    mode_state: ModeSelectorState,
    iteration: i64,
    consecutive_errors: u32,
    stopping: Arc<AtomicBool>,
    started_at: Instant,
}

impl<'a> LoopExecutor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &'a ProjectStore,
        config: LoopConfig,
        project_root: PathBuf,
        project_slug: String,
        adapter: Arc<dyn LlmAdapter>,
        events: EventEmitter,
        stop: StopSignal,
        pause: PauseGate,
    ) -> Self {
        let run_id = events.run_id().to_string();
        Self {
            resources: ResourceManager::new(store, project_root.clone()),
            store,
            config,
            project_root,
            project_slug,
            adapter,
            events,
            stop,
            pause,
            account_id: None,
            settings_path: None,
            run_id,
            mode_state: ModeSelectorState::new(),
            iteration: 0,
            consecutive_errors: 0,
            stopping: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_settings_path(mut self, path: PathBuf) -> Self {
        self.settings_path = Some(path);
        self
    }

    fn is_consumer(&self) -> bool {
        matches!(self.config.loop_type, LoopType::Consumer)
    }

    /// Creates the run row, reaps stale claims (consumer loops only), and
    /// drives iterations until a terminal state is reached.
    pub async fn run_to_completion(&mut self) -> LoopResult<RunOutcome> {
        self.store.create_run(&self.run_id, &self.config.name)?;
        self.events.run_state_changed("active");

        if self.is_consumer() {
            let engine = ClaimEngine::new(self.store);
            let reaped = engine.reap_stale_claims(DEFAULT_STALE_CLAIM_MAX_AGE)?;
            if reaped > 0 {
                info!(loop_name = %self.config.name, reaped, "loop_engine: reaped stale claims before run start");
            }
        }

        let outcome = loop {
            if self.stopping.load(Ordering::Relaxed) {
                break RunOutcome::Aborted;
            }

            if let Some(reason) = self.check_limits() {
                let message = reason.message(&self.config.limits);
                self.persist_terminal(RunStatus::Completed, Some(message))?;
                break RunOutcome::Completed(reason);
            }

            self.pause.wait_while_paused().await;
            if self.stopping.load(Ordering::Relaxed) {
                break RunOutcome::Aborted;
            }

            match self.run_iteration().await {
                Ok(_) => {}
                Err(e) => {
                    warn!(loop_name = %self.config.name, error = %e, "loop_engine: uncaught iteration error");
                    self.persist_terminal(RunStatus::Error, Some(e.to_string()))?;
                    break RunOutcome::Error(e.to_string());
                }
            }
        };

        if matches!(outcome, RunOutcome::Aborted) {
            self.persist_terminal(RunStatus::Aborted, None)?;
        }
        let status_label = match &outcome {
            RunOutcome::Completed(_) => "completed",
            RunOutcome::Aborted => "aborted",
            RunOutcome::Error(_) => "error",
        };
        self.events.run_state_changed(status_label);
        Ok(outcome)
    }

    fn check_limits(&self) -> Option<StopReason> {
        let limits = &self.config.limits;
        if limits.iterations_enabled() && self.iteration >= limits.max_iterations {
            return Some(StopReason::MaxIterations);
        }
        if limits.runtime_enabled() && self.started_at.elapsed().as_secs() as i64 >= limits.max_runtime_seconds {
            return Some(StopReason::MaxRuntime);
        }
        if self.consecutive_errors >= limits.max_consecutive_errors {
            return Some(StopReason::MaxConsecutiveErrors);
        }
        None
    }

    fn persist_terminal(&self, status: RunStatus, error_message: Option<String>) -> LoopResult<()> {
        self.store.update_run(
            &self.run_id,
            RunPatch { status: Some(status), completed_at: Some(Some(projectstore::now_secs())), error_message: Some(error_message) },
        )?;
        Ok(())
    }

    /// One pass of §4.5's per-iteration procedure (steps 3-9). Limit checks
    /// and the pause gate (steps 1-2) are the caller's concern.
    async fn run_iteration(&mut self) -> LoopResult<()> {
        let mode_name = select_mode(&self.config, &self.mode_state).unwrap_or_else(|e| {
            warn!(loop_name = %self.config.name, error = %e, "loop_engine: mode selection failed, using first defined mode");
            self.config.modes.keys().next().cloned().unwrap_or_default()
        });
        let mode = self.config.modes.get(&mode_name).cloned().unwrap_or_default();

        self.iteration += 1;
        self.events.iteration_started(self.iteration, &mode_name);

        let claim_engine = ClaimEngine::new(self.store);
        let source_loop = self.config.item_types.as_ref().and_then(|it| it.input.as_ref()).map(|i| i.source.clone());
        let respect_dependencies = self.config.respect_dependencies;
        let claimer = format!("run:{}", self.run_id);

        let claimed_item = if self.is_consumer() {
            let Some(source) = source_loop.clone() else {
                return Ok(()); // validated at config-load time; defensive no-op here
            };
            let claimed = claim_engine.claim_next(&source, &claimer, None, None, respect_dependencies).await?;
            if claimed.is_none() {
                self.iteration -= 1; // undo: this was a no-op, not a real iteration (§4.5 step 5)
                self.events.heartbeat(self.iteration);
                let wait = Duration::from_secs_f64(5.0_f64.max(self.config.limits.cooldown_between_iterations as f64));
                tokio::time::sleep(wait).await;
                return Ok(());
            }
            claimed
        } else {
            None
        };

        let existing_items = if matches!(self.config.loop_type, LoopType::Generator) {
            self.store.list_work_items(&projectstore::WorkItemFilter {
                source_loop: Some(self.config.name.clone()),
                ..Default::default()
            })?
        } else {
            Vec::new()
        };

        let prompt = self.build_prompt_for(&mode_name, &mode, claimed_item.as_ref(), source_loop.as_deref(), &existing_items)?;

        let settings_path = self.settings_path.clone();
        let request = ExecuteRequest {
            prompt,
            model: mode.model.clone(),
            tools: mode.tools.clone(),
            timeout: Duration::from_secs(mode.timeout),
            json_schema: None,
            account_id: self.account_id.clone(),
            settings_path,
            project_path: self.project_root.clone(),
        };

        let result = self.adapter.execute(request, self.stop.clone()).await;

        let mut items_saved: i64 = 0;
        if result.success {
            if matches!(self.config.loop_type, LoopType::Generator) && !result.text_output.is_empty() {
                let saved = self.persist_extracted_items(&result.text_output)?;
                debug!(loop_name = %self.config.name, saved, "loop_engine: persisted extracted items");
                items_saved = saved as i64;
            }

            if let Some(item) = &claimed_item {
                let ok = claim_engine.complete_with_structured_status(&item.id, &claimer, result.structured_output.as_ref())?;
                if !ok {
                    warn!(item_id = %item.id, "loop_engine: failed to mark claimed item processed (already moved on?)");
                }
            }

            self.consecutive_errors = 0;
            self.events.iteration_completed(self.iteration, EventIterationOutcome::Success);
        } else {
            if let Some(item) = &claimed_item {
                let _ = claim_engine.release(&item.id, &claimer);
            }
            self.consecutive_errors += 1;
            let message = result.error_message.clone().unwrap_or_else(|| "unknown adapter error".to_string());
            self.events.error(message.clone(), result.error_code.clone().unwrap_or_default());
            self.events.iteration_completed(self.iteration, EventIterationOutcome::Failed { reason: message });
        }

        if let Some(session_id) = &result.session_id {
            self.store.create_session(&Session {
                session_id: session_id.clone(),
                run_id: self.run_id.clone(),
                iteration: self.iteration,
                mode: Some(mode_name.clone()),
                started_at: projectstore::now_secs(),
                duration_seconds: None,
                status: Some(if result.success { "completed".to_string() } else { "error".to_string() }),
                items_added: Vec::new(),
            })?;
        }

        self.store.increment_run_counters(&self.run_id, 1, items_saved)?;
        self.store.touch_run_activity(&self.run_id)?;

        if matches!(self.config.mode_selection.strategy, Some(crate::domain::ModeSelectionStrategy::PhaseAware)) && result.success {
            self.mode_state.record_success(&mode_name, &self.config);
        }

        let cooldown = self.config.limits.cooldown_between_iterations;
        if cooldown > 0 {
            tokio::time::sleep(Duration::from_secs(cooldown)).await;
        }

        Ok(())
    }

    fn build_prompt_for(
        &self,
        mode_name: &str,
        mode: &crate::domain::ModeConfig,
        claimed_item: Option<&projectstore::WorkItem>,
        source_loop: Option<&str>,
        existing_items: &[projectstore::WorkItem],
    ) -> LoopResult<String> {
        let template = load_template(&self.project_root, mode);

        let resource_rows = self.resources.list(&projectstore::ResourceFilter { enabled: Some(true), ..Default::default() })?;
        let mut injectable = Vec::with_capacity(resource_rows.len());
        for resource in resource_rows {
            match self.resources.load_content(&resource) {
                Ok(content) => injectable.push(InjectableResource { resource, content }),
                Err(e) => warn!(resource = %resource.name, error = %e, "loop_engine: skipping unreadable resource"),
            }
        }

        let ctx = PromptContext {
            project_root: &self.project_root,
            loop_name: &self.config.name,
            is_generator: matches!(self.config.loop_type, LoopType::Generator),
            mode_name,
            mode,
            run_id: &self.run_id,
            project_slug: &self.project_slug,
            iteration: self.iteration,
            timestamp: projectstore::now_secs(),
            claimed_item,
            batch_items: &[],
            source_loop,
            existing_items,
        };

        Ok(build_prompt(&template, &ctx, &injectable))
    }

    fn persist_extracted_items(&self, output: &str) -> LoopResult<usize> {
        let extracted = extract_work_items(output);
        let mut saved = 0;
        let output_type = self
            .config
            .item_types
            .as_ref()
            .map(|it| it.output.singular.clone())
            .unwrap_or_else(|| "item".to_string());

        for item in extracted {
            let id = item.id.clone().unwrap_or_else(|| Uuid::now_v7().to_string());
            let mut metadata = serde_json::Value::Object(item.metadata);
            if let Some(title) = &item.title {
                metadata["title"] = serde_json::Value::String(title.clone());
            }
            let new_item = NewWorkItem {
                id,
                priority: item.priority,
                content: item.content,
                title: item.title,
                status: Some(WorkItemStatus::Completed),
                category: item.category,
                tags: item.tags,
                metadata,
                source_loop: Some(self.config.name.clone()),
                item_type: output_type.clone(),
                dependencies: item.dependencies,
                phase: None,
            };
            match self.store.create_work_item(new_item) {
                Ok(_) => saved += 1,
                Err(StoreError::Sqlite(e)) => {
                    warn!(error = %e, "loop_engine: skipping item with duplicate or invalid id");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(saved)
    }

    /// Requests cooperative shutdown: terminates the in-flight adapter call
    /// (if any) and causes the loop to abort at the next boundary, allowing
    /// the current iteration to release its claim first (§5 "Cancellation").
    pub fn stop(&self) {
        self.stop_handle().trigger();
    }

    /// A cloneable trigger for [`Self::stop`], obtainable without borrowing
    /// the executor — lets a caller hand a ctrl-c watcher its own handle
    /// before handing `&mut self` to [`Self::run_to_completion`].
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { stopping: self.stopping.clone(), stop: self.stop.clone() }
    }
}

/// See [`LoopExecutor::stop_handle`].
#[derive(Clone)]
pub struct StopHandle {
    stopping: Arc<AtomicBool>,
    stop: StopSignal,
}

impl StopHandle {
    pub fn trigger(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        self.stop.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ItemTypeNames, ItemTypes, Limits, ModeConfig, ModeSelection};
    use crate::llm::{ExecutionResult, StreamEvent};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct ScriptedAdapter {
        results: Mutex<Vec<ExecutionResult>>,
    }

    #[async_trait]
    impl LlmAdapter for ScriptedAdapter {
        async fn execute(&self, _req: ExecuteRequest, _stop: StopSignal) -> ExecutionResult {
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                ExecutionResult { success: true, ..Default::default() }
            } else {
                results.remove(0)
            }
        }

        async fn stream(&self, _req: ExecuteRequest, _stop: StopSignal) -> mpsc::Receiver<StreamEvent> {
            let (_tx, rx) = mpsc::channel(1);
            rx
        }
    }

    fn generator_config() -> LoopConfig {
        let mut modes = HashMap::new();
        modes.insert(
            "generate".to_string(),
            ModeConfig { model: "sonnet".into(), timeout: 60, tools: None, prompt_template_path: "missing.md".into(), phase: None },
        );
        LoopConfig {
            name: "stories".into(),
            loop_type: LoopType::Generator,
            modes,
            mode_selection: ModeSelection { strategy: Some(crate::domain::ModeSelectionStrategy::Fixed), fixed_mode: Some("generate".into()), weights: None },
            limits: Limits { max_iterations: 1, ..Limits::default() },
            item_types: Some(ItemTypes { input: None, output: ItemTypeNames { singular: "story".into(), plural: "stories".into() } }),
            multi_phase: None,
            respect_dependencies: true,
        }
    }

    fn events() -> (EventEmitter, crate::events::EventBus) {
        let bus = crate::events::EventBus::with_default_capacity();
        let emitter = bus.emitter_for("run-1");
        (emitter, bus)
    }

    #[tokio::test]
    async fn generator_run_extracts_and_persists_items() {
        let store = ProjectStore::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (events, _bus) = events();

        let adapter = Arc::new(ScriptedAdapter {
            results: Mutex::new(vec![ExecutionResult {
                success: true,
                text_output: r#"[{"id": "story-1", "content": "Do the thing"}]"#.to_string(),
                ..Default::default()
            }]),
        });

        let mut executor = LoopExecutor::new(
            &store,
            generator_config(),
            dir.path().to_path_buf(),
            "demo".into(),
            adapter,
            events,
            StopSignal::new(),
            PauseGate::new(),
        );

        let outcome = executor.run_to_completion().await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed(StopReason::MaxIterations));

        let items = store.list_work_items(&projectstore::WorkItemFilter::default()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "story-1");
        assert_eq!(items[0].status, WorkItemStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_no_op_iteration_undoes_the_counter_and_does_not_persist() {
        let store = ProjectStore::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (events, _bus) = events();

        let mut modes = HashMap::new();
        modes.insert(
            "implement".to_string(),
            ModeConfig { model: "sonnet".into(), timeout: 60, tools: None, prompt_template_path: "missing.md".into(), phase: None },
        );
        let config = LoopConfig {
            name: "implement".into(),
            loop_type: LoopType::Consumer,
            modes,
            mode_selection: ModeSelection { strategy: Some(crate::domain::ModeSelectionStrategy::Fixed), fixed_mode: Some("implement".into()), weights: None },
            limits: Limits::default(),
            item_types: Some(ItemTypes {
                input: Some(crate::domain::InputItemTypes { source: "stories".into(), singular: "story".into(), plural: "stories".into() }),
                output: ItemTypeNames { singular: "result".into(), plural: "results".into() },
            }),
            multi_phase: None,
            respect_dependencies: true,
        };

        let adapter = Arc::new(ScriptedAdapter { results: Mutex::new(vec![]) });
        let mut executor =
            LoopExecutor::new(&store, config, dir.path().to_path_buf(), "demo".into(), adapter, events, StopSignal::new(), PauseGate::new());

        executor.store.create_run(&executor.run_id, &executor.config.name).unwrap();
        executor.run_iteration().await.unwrap();

        assert_eq!(executor.iteration, 0, "a no-op claim must not advance the iteration counter");

        let run = store.get_run("run-1").unwrap().unwrap();
        assert_eq!(run.iterations_completed, 0, "no-op iterations must not be persisted as completed");
    }

    #[test]
    fn pause_gate_resume_is_observed_without_missed_wakeup() {
        let gate = PauseGate::new();
        gate.pause();
        assert!(gate.is_paused());
        gate.resume();
        assert!(!gate.is_paused());
    }
}
