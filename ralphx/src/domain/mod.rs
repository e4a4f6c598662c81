//! Loop configuration domain types (§3 "Loop Configuration").
//!
//! Unlike work items, runs, sessions and resources (typed rows in
//! `projectstore`), a loop's declarative configuration lives on disk as YAML
//! under `<project>/.ralphx/loops/<name>.yaml` (§6) — there is no DB table
//! for it. This module owns that shape plus the validation pass that must
//! run before a loop config is persisted (§B.1).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// A loop's position in the producer/consumer graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    Generator,
    Consumer,
}

/// Tri-state tool allow-list (§3): absent = all defaults, empty = deny all,
/// non-empty = allow list. `#[serde(default)]` + `Option` round-trips all
/// three states through YAML (key absent vs. present-empty-list).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModeConfig {
    pub model: String,
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    pub prompt_template_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeSelectionStrategy {
    Fixed,
    Random,
    WeightedRandom,
    PhaseAware,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModeSelection {
    pub strategy: Option<ModeSelectionStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<HashMap<String, u32>>,
}

/// `0`/negative disables a limit, except `max_consecutive_errors` (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default)]
    pub max_iterations: i64,
    #[serde(default)]
    pub max_runtime_seconds: i64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default)]
    pub cooldown_between_iterations: u64,
}

fn default_max_consecutive_errors() -> u32 {
    5
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            max_runtime_seconds: 0,
            max_consecutive_errors: default_max_consecutive_errors(),
            cooldown_between_iterations: 0,
        }
    }
}

impl Limits {
    pub fn iterations_enabled(&self) -> bool {
        self.max_iterations > 0
    }

    pub fn runtime_enabled(&self) -> bool {
        self.max_runtime_seconds > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemTypeNames {
    pub singular: String,
    pub plural: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputItemTypes {
    pub source: String,
    pub singular: String,
    pub plural: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemTypes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputItemTypes>,
    pub output: ItemTypeNames,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiPhase {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub auto_phase: bool,
    #[serde(default)]
    pub max_batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_to_phase: Option<HashMap<String, i64>>,
}

/// A loop's full declarative configuration (§3). Identified by `name`, a
/// slug validated against [`validate_loop_name`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub loop_type: LoopType,
    pub modes: HashMap<String, ModeConfig>,
    #[serde(default)]
    pub mode_selection: ModeSelection,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_types: Option<ItemTypes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_phase: Option<MultiPhase>,
    /// Whether the claim engine should respect dependency ordering (§4.4).
    #[serde(default = "default_true")]
    pub respect_dependencies: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid loop name {0:?}: must match ^[a-z0-9_-]{{1,100}}$")]
    InvalidName(String),
    #[error("mode selection strategy is 'fixed' but fixed_mode {0:?} is not a defined mode")]
    UnknownFixedMode(String),
    #[error("mode selection strategy is 'fixed' but fixed_mode is not set")]
    MissingFixedMode,
    #[error("weighted_random weights must sum to 100, got {0}")]
    WeightsDoNotSumTo100(u32),
    #[error("weighted_random strategy requires non-empty weights")]
    MissingWeights,
    #[error("consumer loop {0:?} has no item_types.input.source")]
    MissingSource(String),
    #[error("source loop graph contains a cycle at {0:?}")]
    CyclicSource(String),
    #[error("source loop {0:?} does not reference an existing loop")]
    UnknownSource(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// `^[a-z0-9_-]{1,100}$`, hand-rolled rather than via `regex` since it's a
/// single fixed-character-class check run once per load — grounded on
/// `templates.py`'s equivalent guard against path traversal through the
/// loop name (it becomes a filename: `loops/<name>.yaml`).
pub fn validate_loop_name(name: &str) -> ConfigResult<()> {
    let ok = !name.is_empty()
        && name.len() <= 100
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if ok { Ok(()) } else { Err(ConfigError::InvalidName(name.to_string())) }
}

impl LoopConfig {
    /// Validates invariants that must hold before persistence (§3, §B.1).
    /// `all_loops` is the full set of configured loops, used for source-cycle detection.
    pub fn validate(&self, all_loops: &HashMap<String, LoopConfig>) -> ConfigResult<()> {
        debug!(name = %self.name, "LoopConfig::validate: called");
        validate_loop_name(&self.name)?;

        match self.mode_selection.strategy.unwrap_or(ModeSelectionStrategy::Fixed) {
            ModeSelectionStrategy::Fixed => {
                let Some(fixed) = &self.mode_selection.fixed_mode else {
                    return Err(ConfigError::MissingFixedMode);
                };
                if !self.modes.contains_key(fixed) {
                    return Err(ConfigError::UnknownFixedMode(fixed.clone()));
                }
            }
            ModeSelectionStrategy::WeightedRandom => {
                let weights = self.mode_selection.weights.as_ref().ok_or(ConfigError::MissingWeights)?;
                if weights.is_empty() {
                    return Err(ConfigError::MissingWeights);
                }
                let sum: u32 = weights.values().sum();
                if sum != 100 {
                    return Err(ConfigError::WeightsDoNotSumTo100(sum));
                }
            }
            ModeSelectionStrategy::PhaseAware => {
                if let Some(fixed) = &self.mode_selection.fixed_mode
                    && !self.modes.contains_key(fixed)
                {
                    return Err(ConfigError::UnknownFixedMode(fixed.clone()));
                }
            }
            ModeSelectionStrategy::Random => {}
        }

        if matches!(self.loop_type, LoopType::Consumer) {
            let source = self
                .item_types
                .as_ref()
                .and_then(|it| it.input.as_ref())
                .map(|i| i.source.clone());
            let Some(source) = source else {
                return Err(ConfigError::MissingSource(self.name.clone()));
            };
            if !all_loops.contains_key(&source) {
                return Err(ConfigError::UnknownSource(source));
            }
        }

        detect_source_cycle(self, all_loops)?;
        Ok(())
    }

    pub fn file_name(&self) -> String {
        format!("{}.yaml", self.name)
    }

    pub fn path_in(&self, project_root: &Path) -> PathBuf {
        project_root.join(".ralphx").join("loops").join(self.file_name())
    }

    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn save(&self, project_root: &Path) -> ConfigResult<()> {
        let path = self.path_in(project_root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_yaml::to_string(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Loads every `*.yaml` loop config under `<project>/.ralphx/loops/`.
    pub fn load_all(project_root: &Path) -> ConfigResult<HashMap<String, LoopConfig>> {
        let dir = project_root.join(".ralphx").join("loops");
        let mut out = HashMap::new();
        if !dir.exists() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
                let cfg = LoopConfig::load(&path)?;
                out.insert(cfg.name.clone(), cfg);
            }
        }
        Ok(out)
    }
}

/// DFS cycle check over `item_types.input.source` edges (§4 "Dependency Graph";
/// here applied to the loop-level producer graph rather than the item-level one).
fn detect_source_cycle(start: &LoopConfig, all_loops: &HashMap<String, LoopConfig>) -> ConfigResult<()> {
    let mut visiting: Vec<String> = vec![start.name.clone()];
    let mut current = start.clone();
    loop {
        let Some(source) = current.item_types.as_ref().and_then(|it| it.input.as_ref()).map(|i| i.source.clone())
        else {
            return Ok(());
        };
        if visiting.contains(&source) {
            return Err(ConfigError::CyclicSource(source));
        }
        let Some(next) = all_loops.get(&source) else {
            // Unresolvable sources are reported by the caller's own check;
            // here we just stop walking.
            return Ok(());
        };
        visiting.push(source);
        current = next.clone();
        if visiting.len() > all_loops.len() + 1 {
            // Defensive: a well-formed graph can't walk longer than the loop count.
            return Err(ConfigError::CyclicSource(current.name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_modes() -> HashMap<String, ModeConfig> {
        let mut m = HashMap::new();
        m.insert(
            "turbo".to_string(),
            ModeConfig {
                model: "sonnet".into(),
                timeout: 300,
                tools: None,
                prompt_template_path: "prompts/turbo.md".into(),
                phase: None,
            },
        );
        m
    }

    fn generator(name: &str) -> LoopConfig {
        LoopConfig {
            name: name.into(),
            loop_type: LoopType::Generator,
            modes: base_modes(),
            mode_selection: ModeSelection {
                strategy: Some(ModeSelectionStrategy::Fixed),
                fixed_mode: Some("turbo".into()),
                weights: None,
            },
            limits: Limits::default(),
            item_types: Some(ItemTypes {
                input: None,
                output: ItemTypeNames { singular: "story".into(), plural: "stories".into() },
            }),
            multi_phase: None,
            respect_dependencies: true,
        }
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(validate_loop_name("Has Spaces").is_err());
        assert!(validate_loop_name("").is_err());
        assert!(validate_loop_name("../etc").is_err());
        assert!(validate_loop_name("valid-name_123").is_ok());
    }

    #[test]
    fn fixed_strategy_requires_existing_mode() {
        let mut cfg = generator("gen");
        cfg.mode_selection.fixed_mode = Some("missing".into());
        let all = HashMap::from([(cfg.name.clone(), cfg.clone())]);
        assert!(matches!(cfg.validate(&all), Err(ConfigError::UnknownFixedMode(_))));
    }

    #[test]
    fn weighted_random_requires_sum_100() {
        let mut cfg = generator("gen");
        cfg.mode_selection.strategy = Some(ModeSelectionStrategy::WeightedRandom);
        cfg.mode_selection.weights = Some(HashMap::from([("turbo".to_string(), 70)]));
        let all = HashMap::from([(cfg.name.clone(), cfg.clone())]);
        assert!(matches!(cfg.validate(&all), Err(ConfigError::WeightsDoNotSumTo100(70))));
    }

    #[test]
    fn consumer_requires_source() {
        let mut cfg = generator("consumer");
        cfg.loop_type = LoopType::Consumer;
        cfg.item_types = None;
        let all = HashMap::from([(cfg.name.clone(), cfg.clone())]);
        assert!(matches!(cfg.validate(&all), Err(ConfigError::MissingSource(_))));
    }

    #[test]
    fn detects_source_cycle() {
        let mut a = generator("a");
        a.loop_type = LoopType::Consumer;
        a.item_types = Some(ItemTypes {
            input: Some(InputItemTypes { source: "b".into(), singular: "x".into(), plural: "xs".into() }),
            output: ItemTypeNames { singular: "x".into(), plural: "xs".into() },
        });
        let mut b = generator("b");
        b.loop_type = LoopType::Consumer;
        b.item_types = Some(ItemTypes {
            input: Some(InputItemTypes { source: "a".into(), singular: "y".into(), plural: "ys".into() }),
            output: ItemTypeNames { singular: "y".into(), plural: "ys".into() },
        });
        let all = HashMap::from([(a.name.clone(), a.clone()), (b.name.clone(), b.clone())]);
        assert!(matches!(a.validate(&all), Err(ConfigError::CyclicSource(_))));
    }
}
