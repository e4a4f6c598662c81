//! Claim Engine + Dependency Graph (§4.4): atomic selection/claim/release of
//! work items across concurrent consumer loops, dependency-ordered
//! candidate filtering, stale-claim reaping, and multi-status completion.
//!
//! The selection algorithm and retry back-off follow §4.4; the
//! dependency-graph shape (adjacency list rebuilt per cycle, depth-based
//! phase auto-detection) is ported from `core/executor.py`'s
//! `_build_dependency_graph`/`_get_items_for_phase`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use projectstore::{CompletionOutcome, ProjectStore, StoreError, WorkItem, WorkItemFilter, WorkItemStatus, is_terminal_status};
use serde_json::Value as Json;
use thiserror::Error;
use tracing::warn;

const MAX_CLAIM_RETRIES: u32 = 5;
const CANDIDATE_QUERY_LIMIT: i64 = 100;
pub const DEFAULT_STALE_CLAIM_MAX_AGE: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type ClaimResult<T> = Result<T, ClaimError>;

/// DAG over a source loop's work items, built fresh from their `dependencies`
/// lists on every selection cycle (§9 design note: no cross-cycle retention).
pub struct DependencyGraph {
    deps: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn build(items: &[WorkItem]) -> Self {
        const TRUNCATE_AT: usize = 10_000;
        let mut deps = HashMap::new();
        if items.len() > TRUNCATE_AT {
            warn!(count = items.len(), "dependency graph truncated to {TRUNCATE_AT} items; some edges omitted");
        }
        for item in items.iter().take(TRUNCATE_AT) {
            deps.insert(item.id.clone(), item.dependencies.clone());
        }
        Self { deps }
    }

    /// DFS cycle detection over the dependency adjacency list.
    pub fn has_cycle(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        fn visit<'a>(node: &'a str, deps: &'a HashMap<String, Vec<String>>, marks: &mut HashMap<&'a str, Mark>) -> bool {
            match marks.get(node) {
                Some(Mark::Visiting) => return true,
                Some(Mark::Done) => return false,
                None => {}
            }
            marks.insert(node, Mark::Visiting);
            if let Some(children) = deps.get(node) {
                for child in children {
                    if let Some(child_key) = deps.get_key_value(child).map(|(k, _)| k.as_str())
                        && visit(child_key, deps, marks)
                    {
                        return true;
                    }
                }
            }
            marks.insert(node, Mark::Done);
            false
        }

        for node in self.deps.keys() {
            if visit(node.as_str(), &self.deps, &mut marks) {
                return true;
            }
        }
        false
    }

    /// Items whose every dependency ID is in `completed` (§4.4 step 3).
    pub fn ready_set(&self, completed: &HashSet<String>) -> HashSet<String> {
        self.deps
            .iter()
            .filter(|(_, deps)| deps.iter().all(|d| completed.contains(d)))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Depth = 1 + max(depth of deps); items with no deps are depth 1.
    /// Used for automatic phase partitioning (§4.4 "Phase auto-detection").
    pub fn depths(&self) -> HashMap<String, i64> {
        let mut memo: HashMap<String, i64> = HashMap::new();
        let mut stack_guard: HashSet<String> = HashSet::new();

        fn depth_of(
            id: &str,
            deps: &HashMap<String, Vec<String>>,
            memo: &mut HashMap<String, i64>,
            guard: &mut HashSet<String>,
        ) -> i64 {
            if let Some(d) = memo.get(id) {
                return *d;
            }
            if !guard.insert(id.to_string()) {
                return 1; // cycle guard: treat as depth 1 rather than infinite recursion
            }
            let children = deps.get(id).cloned().unwrap_or_default();
            let max_child_depth = children
                .iter()
                .filter(|c| deps.contains_key(c.as_str()))
                .map(|c| depth_of(c.as_str(), deps, memo, guard))
                .max()
                .unwrap_or(0);
            let d = 1 + max_child_depth;
            memo.insert(id.to_string(), d);
            guard.remove(id);
            d
        }

        let ids: Vec<String> = self.deps.keys().cloned().collect();
        for id in &ids {
            depth_of(id, &self.deps, &mut memo, &mut stack_guard);
        }
        memo
    }
}

/// Partitions items into phases by dependency depth, splitting any phase
/// that exceeds `max_batch_size`.
pub fn auto_phases(items: &[WorkItem], max_batch_size: Option<u32>) -> HashMap<String, i64> {
    let graph = DependencyGraph::build(items);
    let depths = graph.depths();
    let Some(cap) = max_batch_size else { return depths };
    let cap = cap as usize;

    let mut by_phase: HashMap<i64, Vec<String>> = HashMap::new();
    for (id, phase) in &depths {
        by_phase.entry(*phase).or_default().push(id.clone());
    }

    let mut result = HashMap::new();
    let mut next_phase = 1i64;
    let mut phases: Vec<_> = by_phase.into_iter().collect();
    phases.sort_by_key(|(p, _)| *p);
    for (_, mut ids) in phases {
        ids.sort();
        for chunk in ids.chunks(cap.max(1)) {
            for id in chunk {
                result.insert(id.clone(), next_phase);
            }
            next_phase += 1;
        }
    }
    result
}

/// Categories mapped directly to phase numbers, per `multi_phase.category_to_phase`.
pub fn category_phases(items: &[WorkItem], category_to_phase: &HashMap<String, i64>) -> HashMap<String, i64> {
    items
        .iter()
        .filter_map(|i| i.category.as_ref().and_then(|c| category_to_phase.get(c)).map(|p| (i.id.clone(), *p)))
        .collect()
}

pub struct ClaimEngine<'a> {
    store: &'a ProjectStore,
}

impl<'a> ClaimEngine<'a> {
    pub fn new(store: &'a ProjectStore) -> Self {
        Self { store }
    }

    /// Releases every claim older than `max_age` (§4.4 "Stale-claim reaper").
    /// Invoked once before a consumer run begins.
    pub fn reap_stale_claims(&self, max_age: Duration) -> ClaimResult<usize> {
        Ok(self.store.release_stale_claims(max_age)?)
    }

    fn query_candidates(&self, source_loop: &str, category: Option<&str>) -> ClaimResult<Vec<WorkItem>> {
        Ok(self.store.list_work_items(&WorkItemFilter {
            source_loop: Some(source_loop.to_string()),
            status: Some(WorkItemStatus::Completed),
            category: category.map(|c| c.to_string()),
            claimed_by: None,
            limit: Some(CANDIDATE_QUERY_LIMIT),
        })?)
    }

    /// Selection + claim algorithm (§4.4 steps 1-4). `phase_ids`, when set,
    /// restricts candidates to the current phase. `respect_dependencies`
    /// applies dependency-ready filtering with a cycle fallback.
    pub async fn claim_next(
        &self,
        source_loop: &str,
        claimer: &str,
        category: Option<&str>,
        phase_ids: Option<&HashSet<String>>,
        respect_dependencies: bool,
    ) -> ClaimResult<Option<WorkItem>> {
        for attempt in 0..MAX_CLAIM_RETRIES {
            let mut candidates = self.query_candidates(source_loop, category)?;

            if let Some(phase) = phase_ids {
                candidates.retain(|i| phase.contains(&i.id));
            }

            if respect_dependencies && !candidates.is_empty() {
                let all_items = self.store.list_work_items(&WorkItemFilter {
                    source_loop: Some(source_loop.to_string()),
                    status: None,
                    category: None,
                    claimed_by: None,
                    limit: None,
                })?;
                let graph = DependencyGraph::build(&all_items);
                let completed: HashSet<String> =
                    all_items.iter().filter(|i| is_terminal_status(i.status)).map(|i| i.id.clone()).collect();
                let ready = graph.ready_set(&completed);
                let filtered: Vec<WorkItem> = candidates.iter().filter(|c| ready.contains(&c.id)).cloned().collect();

                if filtered.is_empty() && graph.has_cycle() {
                    warn!(loop_name = source_loop, "dependency graph has a cycle; falling back to any unclaimed item");
                } else {
                    candidates = filtered;
                }
            }

            let Some(first) = candidates.into_iter().next() else {
                return Ok(None);
            };

            if self.store.claim_work_item(&first.id, claimer)? {
                return Ok(self.store.get_work_item(&first.id)?);
            }

            tokio::time::sleep(Duration::from_secs_f64(0.01 * (attempt as f64 + 1.0))).await;
        }
        Ok(None)
    }

    /// Batch selection (§4.4 "Batch mode"): repeats single-item claim up to
    /// `batch_size` (capped at 50), stopping early once no item is available.
    pub async fn claim_batch(
        &self,
        source_loop: &str,
        claimer: &str,
        category: Option<&str>,
        phase_ids: Option<&HashSet<String>>,
        respect_dependencies: bool,
        batch_size: usize,
    ) -> ClaimResult<Vec<WorkItem>> {
        let batch_size = batch_size.min(50);
        let mut claimed = Vec::new();
        for _ in 0..batch_size {
            match self.claim_next(source_loop, claimer, category, phase_ids, respect_dependencies).await? {
                Some(item) => claimed.push(item),
                None => break,
            }
        }
        Ok(claimed)
    }

    pub fn release(&self, item_id: &str, claimer: &str) -> ClaimResult<bool> {
        Ok(self.store.release_work_item_claim(item_id, claimer)?)
    }

    pub fn release_all(&self, items: &[WorkItem], claimer: &str) -> ClaimResult<()> {
        for item in items {
            self.store.release_work_item_claim(&item.id, claimer)?;
        }
        Ok(())
    }

    pub fn mark_processed(&self, item_id: &str, claimer: &str) -> ClaimResult<bool> {
        Ok(self.store.mark_work_item_processed(item_id, claimer)?)
    }

    pub fn mark_all_processed(&self, items: &[WorkItem], claimer: &str) -> ClaimResult<()> {
        for item in items {
            self.store.mark_work_item_processed(&item.id, claimer)?;
        }
        Ok(())
    }

    /// Maps a mode's declared `structured_output` JSON to a terminal store
    /// update (§4.4 "Completion with structured status"). Unknown/missing
    /// status is treated as `implemented`.
    pub fn complete_with_structured_status(&self, item_id: &str, claimer: &str, structured_output: Option<&Json>) -> ClaimResult<bool> {
        let outcome = match structured_output.and_then(|v| v.get("status")).and_then(|v| v.as_str()) {
            Some("duplicate") => CompletionOutcome::Duplicate {
                duplicate_of: structured_output
                    .and_then(|v| v.get("duplicate_of"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            Some("skipped") => CompletionOutcome::Skipped {
                skip_reason: structured_output
                    .and_then(|v| v.get("reason"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            Some("external") => {
                let mut merge = serde_json::json!({});
                if let Some(obj) = structured_output {
                    if let Some(system) = obj.get("external_system") {
                        merge["external_system"] = system.clone();
                    }
                    if let Some(reason) = obj.get("status_reason") {
                        merge["status_reason"] = reason.clone();
                    }
                }
                CompletionOutcome::External { merge_metadata: merge }
            }
            Some("error") => CompletionOutcome::Failed,
            Some("implemented") | None | Some(_) => {
                let mut merge = serde_json::json!({});
                if let Some(obj) = structured_output {
                    for key in ["summary", "files_changed", "tests_passed"] {
                        if let Some(v) = obj.get(key) {
                            merge[key] = v.clone();
                        }
                    }
                }
                CompletionOutcome::Processed { merge_metadata: merge }
            }
        };
        Ok(self.store.complete_work_item(item_id, claimer, outcome)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use projectstore::NewWorkItem;

    fn store() -> ProjectStore {
        ProjectStore::open_in_memory().unwrap()
    }

    fn seed(store: &ProjectStore, id: &str, deps: Vec<&str>, source_loop: &str) {
        store
            .create_work_item(NewWorkItem {
                id: id.to_string(),
                content: format!("content {id}"),
                status: Some(WorkItemStatus::Completed),
                source_loop: Some(source_loop.to_string()),
                item_type: "item".to_string(),
                dependencies: deps.into_iter().map(String::from).collect(),
                ..Default::default()
            })
            .unwrap();
    }

    #[tokio::test]
    async fn claim_next_respects_dependency_order() {
        let store = store();
        seed(&store, "A", vec![], "stories");
        seed(&store, "B", vec!["A"], "stories");

        let engine = ClaimEngine::new(&store);
        let claimed = engine.claim_next("stories", "worker-1", None, None, true).await.unwrap();
        assert_eq!(claimed.unwrap().id, "A");

        // B isn't ready yet (A hasn't reached a terminal status), so no item is available.
        let next = engine.claim_next("stories", "worker-2", None, None, true).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn claim_next_falls_back_on_cyclic_graph() {
        let store = store();
        seed(&store, "A", vec!["B"], "stories");
        seed(&store, "B", vec!["A"], "stories");

        let engine = ClaimEngine::new(&store);
        let claimed = engine.claim_next("stories", "worker-1", None, None, true).await.unwrap();
        assert!(claimed.is_some());
    }

    #[test]
    fn depths_assign_phase_one_to_roots() {
        let items = vec![
            WorkItem {
                dependencies: vec![],
                ..test_item("A")
            },
            WorkItem {
                dependencies: vec!["A".into()],
                ..test_item("B")
            },
        ];
        let graph = DependencyGraph::build(&items);
        let depths = graph.depths();
        assert_eq!(depths["A"], 1);
        assert_eq!(depths["B"], 2);
    }

    fn test_item(id: &str) -> WorkItem {
        WorkItem {
            id: id.to_string(),
            priority: None,
            content: String::new(),
            title: None,
            status: WorkItemStatus::Completed,
            category: None,
            tags: vec![],
            metadata: serde_json::json!({}),
            source_loop: Some("stories".into()),
            item_type: "item".into(),
            claimed_by: None,
            claimed_at: None,
            processed_at: None,
            dependencies: vec![],
            phase: None,
            duplicate_of: None,
            skip_reason: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn structured_status_maps_duplicate() {
        let store = store();
        seed(&store, "X", vec![], "stories");
        store.claim_work_item("X", "worker-1").unwrap();
        let engine = ClaimEngine::new(&store);
        let structured = serde_json::json!({"status": "duplicate", "duplicate_of": "Y"});
        let ok = engine.complete_with_structured_status("X", "worker-1", Some(&structured)).unwrap();
        assert!(ok);
        let item = store.get_work_item("X").unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::Duplicate);
        assert_eq!(item.duplicate_of.as_deref(), Some("Y"));
    }
}
