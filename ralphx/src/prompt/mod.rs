//! Prompt Builder (§4.3): assembles the final prompt string handed to the
//! LLM adapter from a mode's template, layered resources, loop context, and
//! any claimed work item(s).
//!
//! Assembly follows an 8-step algorithm (§4.3); the zero-width-space
//! injection-hardening technique and the existing-stories/category-stats
//! generator enrichment are ported from `core/executor.py`'s
//! `_escape_template_vars` and `_build_prompt`.

use std::collections::HashMap;
use std::path::Path;

use projectstore::{InjectionPosition, Resource, WorkItem};
use regex::Regex;
use serde_json::json;

use crate::domain::ModeConfig;

/// Breaks literal `{{`/`}}` in a user-controlled value by inserting a
/// zero-width space between the braces (§4.3 step 7), so a field value that
/// itself contains `{{other_var}}` can't be reinterpreted in a later
/// substitution pass.
pub fn escape_template_vars(value: &str) -> String {
    value.replace("{{", "{\u{200b}{").replace("}}", "}\u{200b}")
}

fn substitute(template: &str, key: &str, value: &str) -> String {
    template.replace(&format!("{{{{{key}}}}}"), value)
}

/// Per-category statistics for generator-context enrichment (§4.3 step 4).
#[derive(Debug, Clone, serde::Serialize)]
pub struct CategoryStats {
    pub count: usize,
    pub ids: Vec<String>,
    pub next_id: String,
}

fn id_suffix_regex() -> Regex {
    Regex::new(r"^([A-Za-z]+)-(\d+)$").expect("valid regex")
}

/// Computes `{{category_stats}}`: per-category counts, id lists, and the
/// next numeric suffix to use, derived from existing items whose ID matches
/// `^[A-Za-z]+-\d+$`.
pub fn category_stats(items: &[WorkItem]) -> HashMap<String, CategoryStats> {
    let re = id_suffix_regex();
    let mut by_category: HashMap<String, (Vec<String>, i64, String)> = HashMap::new();

    for item in items {
        let category = item.category.clone().unwrap_or_else(|| "uncategorized".to_string());
        let entry = by_category.entry(category).or_insert_with(|| (Vec::new(), 0, String::new()));
        entry.0.push(item.id.clone());
        if let Some(caps) = re.captures(&item.id)
            && let Ok(n) = caps[2].parse::<i64>()
            && n > entry.1
        {
            entry.1 = n;
            entry.2 = caps[1].to_string();
        }
    }

    by_category
        .into_iter()
        .map(|(category, (ids, max_n, prefix))| {
            let count = ids.len();
            let next_id = if prefix.is_empty() {
                format!("{category}-1")
            } else {
                format!("{prefix}-{}", max_n + 1)
            };
            (category, CategoryStats { count, ids, next_id })
        })
        .collect()
}

fn list_input_files(project_root: &Path, loop_name: &str) -> Vec<String> {
    let dir = project_root.join(loop_name).join("inputs");
    let Ok(entries) = std::fs::read_dir(&dir) else { return Vec::new() };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

fn sanitize_marker_value(value: &str) -> String {
    value.replace("--", "").replace(['"', '\''], "")
}

pub struct PromptContext<'a> {
    pub project_root: &'a Path,
    pub loop_name: &'a str,
    pub is_generator: bool,
    pub mode_name: &'a str,
    pub mode: &'a ModeConfig,
    pub run_id: &'a str,
    pub project_slug: &'a str,
    pub iteration: i64,
    pub timestamp: i64,
    pub claimed_item: Option<&'a WorkItem>,
    pub batch_items: &'a [WorkItem],
    pub source_loop: Option<&'a str>,
    pub existing_items: &'a [WorkItem],
}

/// A resource with its content loaded, ready for injection.
pub struct InjectableResource {
    pub resource: Resource,
    pub content: String,
}

pub fn build_prompt(template: &str, ctx: &PromptContext<'_>, resources: &[InjectableResource]) -> String {
    let mut by_position: HashMap<InjectionPosition, Vec<&InjectableResource>> = HashMap::new();
    for r in resources {
        if r.resource.enabled {
            by_position.entry(r.resource.injection_position).or_default().push(r);
        }
    }
    for group in by_position.values_mut() {
        group.sort_by_key(|r| r.resource.priority);
    }
    let joined = |pos: InjectionPosition| -> String {
        by_position.get(&pos).map(|rs| rs.iter().map(|r| r.content.clone()).collect::<Vec<_>>().join("\n\n")).unwrap_or_default()
    };

    let mut prompt = template.to_string();

    // Step 3: assemble resources around the template's own anchors.
    let before_prompt = joined(InjectionPosition::BeforePrompt);
    if !before_prompt.is_empty() {
        prompt = format!("{before_prompt}\n\n{prompt}");
    }

    let after_design_doc = joined(InjectionPosition::AfterDesignDoc);
    if !after_design_doc.is_empty() {
        if prompt.contains("{{design_doc}}") {
            prompt = prompt.replacen("{{design_doc}}", &format!("{{{{design_doc}}}}\n\n{after_design_doc}"), 1);
        } else {
            let insertion_point = if before_prompt.is_empty() { 0 } else { before_prompt.len() + 2 };
            prompt.insert_str(insertion_point.min(prompt.len()), &format!("{after_design_doc}\n\n"));
        }
    }

    let before_task = joined(InjectionPosition::BeforeTask);
    if !before_task.is_empty() {
        if prompt.contains("{{task}}") {
            prompt = prompt.replacen("{{task}}", &format!("{before_task}\n\n{{{{task}}}}"), 1);
        } else {
            prompt.push_str(&format!("\n\n{before_task}"));
        }
    }

    let after_task = joined(InjectionPosition::AfterTask);
    if !after_task.is_empty() {
        prompt.push_str(&format!("\n\n{after_task}"));
    }

    // Step 4: generator-loop context enrichment.
    if ctx.is_generator {
        let existing_stories: Vec<_> = ctx
            .existing_items
            .iter()
            .map(|i| json!({"id": i.id, "title": i.title, "category": i.category}))
            .collect();
        prompt = substitute(&prompt, "existing_stories", &escape_template_vars(&serde_json::to_string(&existing_stories).unwrap_or_default()));

        let stats = category_stats(ctx.existing_items);
        prompt = substitute(&prompt, "category_stats", &escape_template_vars(&serde_json::to_string(&stats).unwrap_or_default()));
        prompt = substitute(&prompt, "total_stories", &ctx.existing_items.len().to_string());

        let inputs = list_input_files(ctx.project_root, ctx.loop_name);
        prompt = substitute(&prompt, "inputs_list", &escape_template_vars(&inputs.join(", ")));
    }

    // Step 5: consumer-item substitution, most-specific-first.
    if let Some(item) = ctx.claimed_item {
        let metadata = escape_template_vars(&item.metadata.to_string());
        prompt = substitute(&prompt, "input_item.metadata", &metadata);
        prompt = substitute(&prompt, "input_item.content", &escape_template_vars(&item.content));
        prompt = substitute(&prompt, "input_item.title", &escape_template_vars(item.title.as_deref().unwrap_or("")));
        prompt = substitute(&prompt, "input_item", &escape_template_vars(&item.content));
        prompt = substitute(&prompt, "source_loop", &escape_template_vars(ctx.source_loop.unwrap_or("")));
    }

    // Step 6: batch mode.
    if ctx.batch_items.len() > 1 {
        let mut section = String::from("\n\n## Batch items\n\n");
        for item in ctx.batch_items {
            section.push_str(&format!(
                "- **{}** ({}): {}\n",
                escape_template_vars(&item.id),
                escape_template_vars(item.title.as_deref().unwrap_or("")),
                escape_template_vars(&item.content),
            ));
        }
        prompt.push_str(&section);
    }

    // Step 8: run tracking marker.
    let marker = format!(
        "<!-- run_id={} project={} iteration={} mode={} ts={} -->",
        sanitize_marker_value(ctx.run_id),
        sanitize_marker_value(ctx.project_slug),
        ctx.iteration,
        sanitize_marker_value(ctx.mode_name),
        ctx.timestamp,
    );
    prompt.push_str(&format!("\n\n{marker}"));

    prompt
}

/// Fallback text used when a mode's prompt template file is missing (§4.3 step 1).
pub fn missing_template_placeholder(template_path: &str) -> String {
    format!("(prompt template `{template_path}` not found; using empty template)")
}

pub fn load_template(project_root: &Path, mode: &ModeConfig) -> String {
    let path = project_root.join(&mode.prompt_template_path);
    std::fs::read_to_string(&path).unwrap_or_else(|_| missing_template_placeholder(&mode.prompt_template_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use projectstore::{NewResource, ResourceType};
    use serde_json::json as j;

    fn item(id: &str, category: &str) -> WorkItem {
        WorkItem {
            id: id.to_string(),
            priority: None,
            content: format!("content for {id}"),
            title: Some(format!("Title {id}")),
            status: projectstore::WorkItemStatus::Completed,
            category: Some(category.to_string()),
            tags: vec![],
            metadata: j!({}),
            source_loop: None,
            item_type: "item".to_string(),
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
    fn escape_breaks_double_braces() {
        let escaped = escape_template_vars("{{malicious}}");
        assert!(!escaped.contains("{{malicious}}"));
        assert!(escaped.contains('\u{200b}'));
    }

    #[test]
    fn category_stats_computes_next_id_from_max_suffix() {
        let items = vec![item("STORY-3", "feature"), item("STORY-7", "feature"), item("BUG-1", "bug")];
        let stats = category_stats(&items);
        assert_eq!(stats["feature"].next_id, "STORY-8");
        assert_eq!(stats["feature"].count, 2);
        assert_eq!(stats["bug"].next_id, "BUG-2");
    }

    #[test]
    fn consumer_substitution_injects_claimed_item() {
        let claimed = item("ITEM-1", "feature");
        let mode = ModeConfig {
            model: "sonnet".into(),
            timeout: 300,
            tools: None,
            prompt_template_path: "template.md".into(),
            phase: None,
        };
        let ctx = PromptContext {
            project_root: Path::new("/tmp/project"),
            loop_name: "implement",
            is_generator: false,
            mode_name: "implement",
            mode: &mode,
            run_id: "run-1",
            project_slug: "demo",
            iteration: 1,
            timestamp: 1000,
            claimed_item: Some(&claimed),
            batch_items: &[],
            source_loop: Some("stories"),
            existing_items: &[],
        };
        let prompt = build_prompt("Task: {{input_item.content}}", &ctx, &[]);
        assert!(prompt.contains("content for ITEM-1"));
        assert!(prompt.contains("<!-- run_id=run-1"));
    }

    #[test]
    fn generator_enrichment_fills_totals_and_stories() {
        let mode = ModeConfig {
            model: "sonnet".into(),
            timeout: 300,
            tools: None,
            prompt_template_path: "template.md".into(),
            phase: None,
        };
        let items = vec![item("STORY-1", "feature")];
        let ctx = PromptContext {
            project_root: Path::new("/tmp/project"),
            loop_name: "stories",
            is_generator: true,
            mode_name: "generate",
            mode: &mode,
            run_id: "run-1",
            project_slug: "demo",
            iteration: 1,
            timestamp: 1000,
            claimed_item: None,
            batch_items: &[],
            source_loop: None,
            existing_items: &items,
        };
        let prompt = build_prompt("Total: {{total_stories}}", &ctx, &[]);
        assert!(prompt.contains("Total: 1"));
    }

    #[test]
    fn resource_injected_after_design_doc_anchor() {
        let store = projectstore::ProjectStore::open_in_memory().unwrap();
        let resource_row = store
            .create_resource(NewResource {
                name: "architecture".into(),
                resource_type: ResourceType::Architecture,
                file_path: "/tmp/architecture.md".into(),
                injection_position: InjectionPosition::AfterDesignDoc,
                enabled: true,
                inherit_default: true,
                priority: 100,
            })
            .unwrap();
        let resources = vec![InjectableResource { resource: resource_row, content: "ARCH NOTES".into() }];
        let mode = ModeConfig {
            model: "sonnet".into(),
            timeout: 300,
            tools: None,
            prompt_template_path: "t.md".into(),
            phase: None,
        };
        let ctx = PromptContext {
            project_root: Path::new("/tmp/project"),
            loop_name: "stories",
            is_generator: false,
            mode_name: "generate",
            mode: &mode,
            run_id: "run-1",
            project_slug: "demo",
            iteration: 1,
            timestamp: 1000,
            claimed_item: None,
            batch_items: &[],
            source_loop: None,
            existing_items: &[],
        };
        let prompt = build_prompt("Doc: {{design_doc}}\n\nBody.", &ctx, &resources);
        assert!(prompt.contains("{{design_doc}}\n\nARCH NOTES"));
    }
}
