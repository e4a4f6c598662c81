//! Integration tests driving the claim engine, loop executor, resource
//! manager and doctor together against a real (in-memory) project store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use projectstore::{
    NewWorkItem, ProjectStore, ResourceEdit, ResourceType, ResourceUpdateOutcome, WorkItemFilter, WorkItemStatus,
};
use ralphx::ClaimEngine;
use ralphx::doctor::{Doctor, StaleReason};
use ralphx::domain::{
    InputItemTypes, ItemTypeNames, ItemTypes, Limits, LoopConfig, LoopType, ModeConfig, ModeSelection,
    ModeSelectionStrategy,
};
use ralphx::events::create_event_bus;
use ralphx::llm::{ExecuteRequest, ExecutionResult, LlmAdapter, StopSignal, StreamEvent};
use ralphx::loop_engine::{LoopExecutor, PauseGate, RunOutcome, StopReason, select_mode, ModeSelectorState};
use ralphx::resources::ResourceManager;

// =============================================================================
// Claim Engine / Dependency Ordering
// =============================================================================

fn seed_item(store: &ProjectStore, id: &str, deps: Vec<&str>, source_loop: &str) {
    store
        .create_work_item(NewWorkItem {
            id: id.to_string(),
            content: format!("content for {id}"),
            status: Some(WorkItemStatus::Completed),
            source_loop: Some(source_loop.to_string()),
            item_type: "item".to_string(),
            dependencies: deps.into_iter().map(String::from).collect(),
            ..Default::default()
        })
        .unwrap();
}

#[tokio::test]
async fn linear_dependency_chain_is_claimed_and_completed_in_order() {
    let store = ProjectStore::open_in_memory().expect("open in-memory store");
    seed_item(&store, "a", vec![], "stories");
    seed_item(&store, "b", vec!["a"], "stories");
    seed_item(&store, "c", vec!["b"], "stories");

    let engine = ClaimEngine::new(&store);
    let mut processed_order = Vec::new();

    for _ in 0..3 {
        let item = engine
            .claim_next("stories", "worker-1", None, None, true)
            .await
            .expect("claim_next should not error")
            .expect("a ready item must be available at each step");
        processed_order.push(item.id.clone());
        let ok = engine
            .complete_with_structured_status(&item.id, "worker-1", None)
            .expect("completion should not error");
        assert!(ok, "claimed item {} should complete", item.id);
    }

    assert_eq!(processed_order, vec!["a", "b", "c"], "items must be claimed in dependency order");

    let remaining = engine.claim_next("stories", "worker-1", None, None, true).await.unwrap();
    assert!(remaining.is_none(), "no more items should be claimable once the chain is drained");
}

#[tokio::test]
async fn concurrent_claimers_never_both_win_the_same_item() {
    let store = Arc::new(ProjectStore::open_in_memory().expect("open in-memory store"));
    seed_item(&store, "solo", vec![], "stories");

    let store_a = store.clone();
    let store_b = store.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { ClaimEngine::new(&store_a).claim_next("stories", "worker-a", None, None, true).await }),
        tokio::spawn(async move { ClaimEngine::new(&store_b).claim_next("stories", "worker-b", None, None, true).await }),
    );

    let a = a.unwrap().unwrap();
    let b = b.unwrap().unwrap();
    let winners = [a, b].into_iter().flatten().count();
    assert_eq!(winners, 1, "exactly one concurrent claimer must win the single available item");
}

#[tokio::test]
async fn stale_claim_reaper_releases_abandoned_claims() {
    let store = ProjectStore::open_in_memory().expect("open in-memory store");
    seed_item(&store, "x", vec![], "stories");

    let engine = ClaimEngine::new(&store);
    let claimed = engine.claim_next("stories", "worker-1", None, None, true).await.unwrap().expect("item available");
    assert_eq!(claimed.status, WorkItemStatus::Claimed);

    // claimed_at has second resolution; sleep past the second boundary so a
    // zero-duration max_age reliably treats the claim as older than "now".
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let reaped = engine.reap_stale_claims(Duration::from_secs(0)).expect("reap should not error");
    assert_eq!(reaped, 1);

    let item = store.get_work_item("x").unwrap().expect("item still exists");
    assert!(item.claimed_by.is_none(), "claim must be released");
    assert_eq!(item.status, WorkItemStatus::Completed, "a source-loop item reverts to completed, not pending");
}

// =============================================================================
// Loop Executor
// =============================================================================

/// Replays a fixed queue of results, one per call to `execute`.
struct QueuedAdapter {
    results: Mutex<Vec<ExecutionResult>>,
}

#[async_trait]
impl LlmAdapter for QueuedAdapter {
    async fn execute(&self, _req: ExecuteRequest, _stop: StopSignal) -> ExecutionResult {
        let mut results = self.results.lock().unwrap();
        if results.is_empty() { ExecutionResult { success: true, ..Default::default() } } else { results.remove(0) }
    }

    async fn stream(&self, _req: ExecuteRequest, _stop: StopSignal) -> mpsc::Receiver<StreamEvent> {
        let (_tx, rx) = mpsc::channel(1);
        rx
    }
}

fn generator_config(max_iterations: i64) -> LoopConfig {
    let mut modes = HashMap::new();
    modes.insert(
        "generate".to_string(),
        ModeConfig { model: "sonnet".into(), timeout: 60, tools: None, prompt_template_path: "missing.md".into(), phase: None },
    );
    LoopConfig {
        name: "stories".into(),
        loop_type: LoopType::Generator,
        modes,
        mode_selection: ModeSelection {
            strategy: Some(ModeSelectionStrategy::Fixed),
            fixed_mode: Some("generate".into()),
            weights: None,
        },
        limits: Limits { max_iterations, ..Limits::default() },
        item_types: Some(ItemTypes { input: None, output: ItemTypeNames { singular: "story".into(), plural: "stories".into() } }),
        multi_phase: None,
        respect_dependencies: true,
    }
}

#[tokio::test]
async fn generator_run_extracts_items_across_multiple_iterations() {
    let store = ProjectStore::open_in_memory().expect("open in-memory store");
    let dir = tempfile::tempdir().unwrap();
    let bus = create_event_bus();
    let events = bus.emitter_for("run-multi");

    let adapter = Arc::new(QueuedAdapter {
        results: Mutex::new(vec![
            ExecutionResult {
                success: true,
                text_output: r#"[{"id": "story-1", "content": "first"}]"#.to_string(),
                ..Default::default()
            },
            ExecutionResult {
                success: true,
                text_output: r#"[{"id": "story-2", "content": "second"}]"#.to_string(),
                ..Default::default()
            },
        ]),
    });

    let mut executor = LoopExecutor::new(
        &store,
        generator_config(2),
        dir.path().to_path_buf(),
        "demo".into(),
        adapter,
        events,
        StopSignal::new(),
        PauseGate::new(),
    );

    let outcome = executor.run_to_completion().await.expect("run should not error");
    assert_eq!(outcome, RunOutcome::Completed(StopReason::MaxIterations));

    let mut items = store.list_work_items(&WorkItemFilter::default()).unwrap();
    items.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(), vec!["story-1", "story-2"]);
}

// =============================================================================
// Resource Manager — optimistic concurrency
// =============================================================================

#[tokio::test]
async fn resource_edit_with_stale_expected_updated_at_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProjectStore::open_in_memory().expect("open in-memory store");
    let manager = ResourceManager::new(&store, dir.path());

    let resource = manager.create(ResourceType::Custom, "guardrails", "be careful").expect("create resource");

    let first = manager
        .edit(resource.id, ResourceEdit { content: Some("be very careful".into()), expected_updated_at: Some(resource.updated_at), ..Default::default() })
        .expect("first edit should not error");
    let ResourceUpdateOutcome::Updated(updated) = first else { panic!("first edit should win the optimistic lock") };

    // A second editor who read the resource before the first edit lands submits the same stale timestamp.
    let second = manager
        .edit(resource.id, ResourceEdit { content: Some("actually don't worry".into()), expected_updated_at: Some(resource.updated_at), ..Default::default() })
        .expect("second edit should not error, just conflict");
    assert!(matches!(second, ResourceUpdateOutcome::Conflict { .. }), "stale expected_updated_at must be rejected");

    assert_eq!(manager.load_content(&updated).unwrap(), "be very careful", "only the first edit's content survives");
}

// =============================================================================
// Mode selection
// =============================================================================

#[test]
fn weighted_random_selection_respects_configured_ratio_over_many_draws() {
    let mut modes = HashMap::new();
    modes.insert("turbo".to_string(), ModeConfig { model: "sonnet".into(), timeout: 60, tools: None, prompt_template_path: "t.md".into(), phase: None });
    modes.insert("deep".to_string(), ModeConfig { model: "opus".into(), timeout: 60, tools: None, prompt_template_path: "d.md".into(), phase: None });
    let weights = HashMap::from([("turbo".to_string(), 90), ("deep".to_string(), 10)]);

    let config = LoopConfig {
        name: "work".into(),
        loop_type: LoopType::Generator,
        modes,
        mode_selection: ModeSelection { strategy: Some(ModeSelectionStrategy::WeightedRandom), fixed_mode: None, weights: Some(weights) },
        limits: Limits::default(),
        item_types: Some(ItemTypes { input: None, output: ItemTypeNames { singular: "item".into(), plural: "items".into() } }),
        multi_phase: None,
        respect_dependencies: true,
    };
    let state = ModeSelectorState::new();

    let mut turbo = 0;
    let total = 5_000;
    for _ in 0..total {
        if select_mode(&config, &state).unwrap() == "turbo" {
            turbo += 1;
        }
    }
    let ratio = turbo as f64 / total as f64;
    assert!((0.82..=0.98).contains(&ratio), "empirical ratio {ratio} drifted too far from the configured 90/10 split");
}

// =============================================================================
// Doctor
// =============================================================================

#[tokio::test]
async fn doctor_flags_and_cleans_up_a_run_with_stale_activity() {
    let store = ProjectStore::open_in_memory().expect("open in-memory store");
    store.create_run("run-doctor", "implement").expect("create run");

    // create_run stamps the real (live) test-process pid, so the pid-liveness
    // check alone won't mark this stale; force the activity-age check instead
    // by letting a full second elapse against a zero-minute threshold.
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let doctor = Doctor::with_threshold(&store, 0);
    let findings = doctor.scan().expect("scan should not error");
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].run_id, "run-doctor");
    assert!(
        matches!(findings[0].reason, StaleReason::ActivityTimeout | StaleReason::PidReuseSuspected),
        "unexpected stale reason: {:?}",
        findings[0].reason
    );

    let cleaned = doctor.cleanup().expect("cleanup should not error");
    assert_eq!(cleaned.len(), 1);

    let run = store.get_run("run-doctor").unwrap().expect("run still exists");
    assert_eq!(run.status, projectstore::RunStatus::Aborted);
    assert!(run.error_message.is_some());
}

// =============================================================================
// Loop configuration validation
// =============================================================================

#[test]
fn consumer_loop_config_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();

    let mut generator_modes = HashMap::new();
    generator_modes.insert("generate".to_string(), ModeConfig { model: "sonnet".into(), timeout: 60, tools: None, prompt_template_path: "g.md".into(), phase: None });
    let generator = LoopConfig {
        name: "stories".into(),
        loop_type: LoopType::Generator,
        modes: generator_modes,
        mode_selection: ModeSelection { strategy: Some(ModeSelectionStrategy::Fixed), fixed_mode: Some("generate".into()), weights: None },
        limits: Limits::default(),
        item_types: Some(ItemTypes { input: None, output: ItemTypeNames { singular: "story".into(), plural: "stories".into() } }),
        multi_phase: None,
        respect_dependencies: true,
    };

    let mut consumer_modes = HashMap::new();
    consumer_modes.insert("implement".to_string(), ModeConfig { model: "sonnet".into(), timeout: 60, tools: None, prompt_template_path: "i.md".into(), phase: None });
    let consumer = LoopConfig {
        name: "implement".into(),
        loop_type: LoopType::Consumer,
        modes: consumer_modes,
        mode_selection: ModeSelection { strategy: Some(ModeSelectionStrategy::Fixed), fixed_mode: Some("implement".into()), weights: None },
        limits: Limits::default(),
        item_types: Some(ItemTypes {
            input: Some(InputItemTypes { source: "stories".into(), singular: "story".into(), plural: "stories".into() }),
            output: ItemTypeNames { singular: "result".into(), plural: "results".into() },
        }),
        multi_phase: None,
        respect_dependencies: true,
    };

    generator.save(dir.path()).expect("save generator config");
    consumer.save(dir.path()).expect("save consumer config");

    let loaded = LoopConfig::load_all(dir.path()).expect("load_all should not error");
    assert_eq!(loaded.len(), 2);
    for (name, cfg) in &loaded {
        cfg.validate(&loaded).unwrap_or_else(|e| panic!("loop {name} should validate cleanly: {e}"));
    }
}
