//! Mode selection strategies (§4.5 step 3).

use std::collections::HashSet;

use rand::Rng as _;
use thiserror::Error;

use crate::domain::{LoopConfig, ModeSelectionStrategy};

/// Tracks the `phase_aware` strategy's one-shot walk through phase-1 modes.
/// Not persisted across process restarts — a restarted executor re-walks
/// phase 1, which is acceptable since phase-1 modes are idempotent-by-design
/// generator/setup steps (§B — an accepted limitation, not a requirement
/// to persist this state).
#[derive(Debug, Default)]
pub struct ModeSelectorState {
    phase1_complete: bool,
    phase1_succeeded: HashSet<String>,
}

impl ModeSelectorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, mode_name: &str, config: &LoopConfig) {
        if self.phase1_complete {
            return;
        }
        self.phase1_succeeded.insert(mode_name.to_string());
        let phase1_modes = phase1_mode_names(config);
        if !phase1_modes.is_empty() && phase1_modes.iter().all(|m| self.phase1_succeeded.contains(m)) {
            self.phase1_complete = true;
        }
    }
}

/// Modes tagged `phase: phase_1`, in a stable (name-sorted) order — the
/// underlying `HashMap<String, ModeConfig>` doesn't preserve YAML definition
/// order, so this substitutes a deterministic order for it (DESIGN.md Open
/// Questions).
fn phase1_mode_names(config: &LoopConfig) -> Vec<String> {
    let mut names: Vec<String> = config
        .modes
        .iter()
        .filter(|(_, m)| m.phase.as_deref() == Some("phase_1"))
        .map(|(name, _)| name.clone())
        .collect();
    names.sort();
    names
}

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("loop has no modes defined")]
    NoModes,
    #[error("fixed_mode {0:?} is not a defined mode")]
    UnknownFixedMode(String),
}

/// Selects the next mode name per the loop's configured strategy (§4.5 step 3).
pub fn select_mode(config: &LoopConfig, state: &ModeSelectorState) -> Result<String, SelectError> {
    if config.modes.is_empty() {
        return Err(SelectError::NoModes);
    }

    match config.mode_selection.strategy.unwrap_or(ModeSelectionStrategy::Fixed) {
        ModeSelectionStrategy::Fixed => fixed_mode(config),
        ModeSelectionStrategy::Random => Ok(random_mode(config)),
        ModeSelectionStrategy::WeightedRandom => weighted_random_mode(config),
        ModeSelectionStrategy::PhaseAware => {
            if !state.phase1_complete {
                let phase1 = phase1_mode_names(config);
                if let Some(next) = phase1.into_iter().find(|m| !state.phase1_succeeded.contains(m)) {
                    return Ok(next);
                }
            }
            fixed_mode(config)
        }
    }
}

fn fixed_mode(config: &LoopConfig) -> Result<String, SelectError> {
    let name = config.mode_selection.fixed_mode.clone().ok_or(SelectError::NoModes)?;
    if !config.modes.contains_key(&name) {
        return Err(SelectError::UnknownFixedMode(name));
    }
    Ok(name)
}

fn random_mode(config: &LoopConfig) -> String {
    let mut names: Vec<&String> = config.modes.keys().collect();
    names.sort();
    let idx = rand::rng().random_range(0..names.len());
    names[idx].clone()
}

fn weighted_random_mode(config: &LoopConfig) -> Result<String, SelectError> {
    let weights = config.mode_selection.weights.as_ref().ok_or(SelectError::NoModes)?;
    let mut entries: Vec<(&String, &u32)> = weights.iter().collect();
    entries.sort_by_key(|(name, _)| name.as_str());
    let total: u32 = entries.iter().map(|(_, w)| **w).sum();
    let mut roll = rand::rng().random_range(0..total.max(1));
    for (name, weight) in entries {
        if roll < *weight {
            return Ok(name.clone());
        }
        roll -= *weight;
    }
    Err(SelectError::NoModes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ItemTypeNames, ItemTypes, Limits, LoopType, ModeConfig, ModeSelection};
    use std::collections::HashMap;

    fn config_with(strategy: ModeSelectionStrategy, weights: Option<HashMap<String, u32>>, fixed: Option<&str>) -> LoopConfig {
        let mut modes = HashMap::new();
        modes.insert("turbo".to_string(), ModeConfig { model: "sonnet".into(), timeout: 60, tools: None, prompt_template_path: "t.md".into(), phase: None });
        modes.insert("deep".to_string(), ModeConfig { model: "opus".into(), timeout: 60, tools: None, prompt_template_path: "d.md".into(), phase: None });
        LoopConfig {
            name: "work".into(),
            loop_type: LoopType::Generator,
            modes,
            mode_selection: ModeSelection { strategy: Some(strategy), fixed_mode: fixed.map(String::from), weights },
            limits: Limits::default(),
            item_types: Some(ItemTypes { input: None, output: ItemTypeNames { singular: "item".into(), plural: "items".into() } }),
            multi_phase: None,
            respect_dependencies: true,
        }
    }

    #[test]
    fn fixed_selects_configured_mode() {
        let cfg = config_with(ModeSelectionStrategy::Fixed, None, Some("turbo"));
        let state = ModeSelectorState::new();
        assert_eq!(select_mode(&cfg, &state).unwrap(), "turbo");
    }

    #[test]
    fn weighted_random_stays_within_defined_modes() {
        let weights = HashMap::from([("turbo".to_string(), 80), ("deep".to_string(), 20)]);
        let cfg = config_with(ModeSelectionStrategy::WeightedRandom, Some(weights), None);
        let state = ModeSelectorState::new();
        for _ in 0..50 {
            let mode = select_mode(&cfg, &state).unwrap();
            assert!(mode == "turbo" || mode == "deep");
        }
    }

    #[test]
    fn weighted_random_empirical_ratio_matches_weights() {
        let weights = HashMap::from([("turbo".to_string(), 80), ("deep".to_string(), 20)]);
        let cfg = config_with(ModeSelectionStrategy::WeightedRandom, Some(weights), None);
        let state = ModeSelectorState::new();
        let mut turbo = 0;
        let total = 10_000;
        for _ in 0..total {
            if select_mode(&cfg, &state).unwrap() == "turbo" {
                turbo += 1;
            }
        }
        let ratio = turbo as f64 / total as f64;
        assert!((0.7..=0.9).contains(&ratio), "ratio {ratio} out of expected band");
    }

    #[test]
    fn phase_aware_walks_phase1_then_falls_back_to_fixed() {
        let mut modes = HashMap::new();
        modes.insert("setup".to_string(), ModeConfig { model: "sonnet".into(), timeout: 60, tools: None, prompt_template_path: "s.md".into(), phase: Some("phase_1".into()) });
        modes.insert("implement".to_string(), ModeConfig { model: "sonnet".into(), timeout: 60, tools: None, prompt_template_path: "i.md".into(), phase: None });
        let cfg = LoopConfig {
            name: "work".into(),
            loop_type: LoopType::Consumer,
            modes,
            mode_selection: ModeSelection { strategy: Some(ModeSelectionStrategy::PhaseAware), fixed_mode: Some("implement".into()), weights: None },
            limits: Limits::default(),
            item_types: Some(ItemTypes {
                input: Some(crate::domain::InputItemTypes { source: "gen".into(), singular: "x".into(), plural: "xs".into() }),
                output: ItemTypeNames { singular: "x".into(), plural: "xs".into() },
            }),
            multi_phase: None,
            respect_dependencies: true,
        };
        let mut state = ModeSelectorState::new();
        assert_eq!(select_mode(&cfg, &state).unwrap(), "setup");
        state.record_success("setup", &cfg);
        assert_eq!(select_mode(&cfg, &state).unwrap(), "implement");
    }
}
