//! Row types for the project store's typed tables.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    Claimed,
    Completed,
    Processed,
    Duplicate,
    Skipped,
    External,
    Failed,
}

impl WorkItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::Claimed => "claimed",
            WorkItemStatus::Completed => "completed",
            WorkItemStatus::Processed => "processed",
            WorkItemStatus::Duplicate => "duplicate",
            WorkItemStatus::Skipped => "skipped",
            WorkItemStatus::External => "external",
            WorkItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => WorkItemStatus::Pending,
            "claimed" => WorkItemStatus::Claimed,
            "completed" => WorkItemStatus::Completed,
            "processed" => WorkItemStatus::Processed,
            "duplicate" => WorkItemStatus::Duplicate,
            "skipped" => WorkItemStatus::Skipped,
            "external" => WorkItemStatus::External,
            "failed" => WorkItemStatus::Failed,
            _ => return None,
        })
    }
}

/// "Item has reached a terminal state" per the dependency-ordering invariant (§8.4).
pub fn is_terminal_status(s: WorkItemStatus) -> bool {
    matches!(
        s,
        WorkItemStatus::Processed | WorkItemStatus::Failed | WorkItemStatus::Skipped | WorkItemStatus::Duplicate
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub priority: Option<i64>,
    pub content: String,
    pub title: Option<String>,
    pub status: WorkItemStatus,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Json,
    pub source_loop: Option<String>,
    pub item_type: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    pub processed_at: Option<i64>,
    pub dependencies: Vec<String>,
    pub phase: Option<i64>,
    pub duplicate_of: Option<String>,
    pub skip_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields accepted when a generator (or an import path) persists a new item.
#[derive(Debug, Clone, Default)]
pub struct NewWorkItem {
    pub id: String,
    pub priority: Option<i64>,
    pub content: String,
    pub title: Option<String>,
    pub status: Option<WorkItemStatus>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Json,
    pub source_loop: Option<String>,
    pub item_type: String,
    pub dependencies: Vec<String>,
    pub phase: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkItemFilter {
    pub source_loop: Option<String>,
    pub status: Option<WorkItemStatus>,
    pub category: Option<String>,
    pub claimed_by: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkItemStats {
    pub by_status: std::collections::HashMap<String, i64>,
    pub by_category: std::collections::HashMap<String, i64>,
    pub by_priority: std::collections::HashMap<i64, i64>,
    pub total: i64,
}

/// The terminal outcome reported by a consumer mode's structured output (§4.4).
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    Processed {
        merge_metadata: Json,
    },
    Duplicate {
        duplicate_of: String,
    },
    Skipped {
        skip_reason: String,
    },
    External {
        merge_metadata: Json,
    },
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Paused,
    Completed,
    Error,
    Aborted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Active => "active",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "active" => RunStatus::Active,
            "paused" => RunStatus::Paused,
            "completed" => RunStatus::Completed,
            "error" => RunStatus::Error,
            "aborted" => RunStatus::Aborted,
            _ => return None,
        })
    }

    /// Runs in one of these states are done and must never be reclassified by the Doctor (§4.6).
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Error | RunStatus::Aborted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub loop_name: String,
    pub status: RunStatus,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub iterations_completed: i64,
    pub items_generated: i64,
    pub error_message: Option<String>,
    pub executor_pid: Option<i64>,
    pub last_activity_at: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub completed_at: Option<Option<i64>>,
    pub error_message: Option<Option<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub run_id: String,
    pub iteration: i64,
    pub mode: Option<String>,
    pub started_at: i64,
    pub duration_seconds: Option<f64>,
    pub status: Option<String>,
    pub items_added: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    DesignDoc,
    Architecture,
    CodingStandards,
    DomainKnowledge,
    Custom,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::DesignDoc => "design_doc",
            ResourceType::Architecture => "architecture",
            ResourceType::CodingStandards => "coding_standards",
            ResourceType::DomainKnowledge => "domain_knowledge",
            ResourceType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "design_doc" => ResourceType::DesignDoc,
            "architecture" => ResourceType::Architecture,
            "coding_standards" => ResourceType::CodingStandards,
            "domain_knowledge" => ResourceType::DomainKnowledge,
            "custom" => ResourceType::Custom,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionPosition {
    BeforePrompt,
    AfterDesignDoc,
    BeforeTask,
    AfterTask,
}

impl InjectionPosition {
    pub fn as_str(self) -> &'static str {
        match self {
            InjectionPosition::BeforePrompt => "before_prompt",
            InjectionPosition::AfterDesignDoc => "after_design_doc",
            InjectionPosition::BeforeTask => "before_task",
            InjectionPosition::AfterTask => "after_task",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "before_prompt" => InjectionPosition::BeforePrompt,
            "after_design_doc" => InjectionPosition::AfterDesignDoc,
            "before_task" => InjectionPosition::BeforeTask,
            "after_task" => InjectionPosition::AfterTask,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: i64,
    pub name: String,
    pub resource_type: ResourceType,
    pub file_path: String,
    pub injection_position: InjectionPosition,
    pub enabled: bool,
    pub inherit_default: bool,
    pub priority: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NewResource {
    pub name: String,
    pub resource_type: ResourceType,
    pub file_path: String,
    pub injection_position: InjectionPosition,
    pub enabled: bool,
    pub inherit_default: bool,
    pub priority: i64,
}

impl Default for ResourceType {
    fn default() -> Self {
        ResourceType::Custom
    }
}

impl Default for InjectionPosition {
    fn default() -> Self {
        InjectionPosition::AfterDesignDoc
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceFilter {
    pub resource_type: Option<ResourceType>,
    pub enabled: Option<bool>,
    pub inherit_default: Option<bool>,
}

/// A content-affecting edit to a resource, as the filesystem-sync / HTTP
/// collaborator would submit it (§4.7).
#[derive(Debug, Clone, Default)]
pub struct ResourceEdit {
    pub name: Option<String>,
    pub content: Option<String>,
    pub enabled: Option<bool>,
    pub inherit_default: Option<bool>,
    pub priority: Option<i64>,
    pub injection_position: Option<InjectionPosition>,
    pub expected_updated_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceVersion {
    pub id: i64,
    pub resource_id: i64,
    pub name: String,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub enum ResourceUpdateOutcome {
    Updated(Resource),
    Conflict { current: Resource },
}
