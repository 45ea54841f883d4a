//! Loop configuration stored as `config.toml` in the state directory.
//!
//! Constructed once at startup (file, then CLI overrides), validated, and
//! passed by reference to every component. Nothing reads thresholds from
//! anywhere else.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::store::write_atomic;
use crate::core::gates::GateConfig;
use crate::core::opportunity::{ExplorationPolicy, OpportunitySpec, ScoringPolicy};

/// Loop configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    /// Champion seeded on `init` when no champion exists yet.
    pub baseline_score: Option<f64>,

    /// Minimum spacing between generator calls, in seconds.
    pub min_delay_secs: u64,

    pub limits: LimitsConfig,
    pub generator: GeneratorConfig,
    pub evaluator: EvaluatorConfig,
    pub gates: GateConfig,
    pub scoring: ScoringPolicy,
    pub exploration: ExplorationPolicy,

    /// Opportunity catalog; empty means free-form generation.
    pub opportunities: Vec<OpportunitySpec>,
}

/// Stop conditions. All optional; with none set the loop runs until killed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Total iterations across restarts (compared against the counter).
    pub max_iterations: Option<u64>,
    /// Wall-clock budget measured from `start_timestamp`.
    pub max_runtime_secs: Option<u64>,
    /// Stop once the champion's effective score reaches this.
    pub target_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Generation collaborator command; the prompt is fed on stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Grace between SIGTERM and forced kill.
    pub grace_secs: u64,
    /// Truncate captured stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Upper bound on the rendered prompt.
    pub prompt_budget_bytes: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: vec!["evoloop-generate".to_string()],
            timeout_secs: 30 * 60,
            grace_secs: 10,
            output_limit_bytes: 100_000,
            prompt_budget_bytes: 40_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Evaluation collaborator command; `--candidate <path> --tier <tier>` is appended.
    pub command: Vec<String>,
    /// Worker budget W for batch evaluation.
    pub workers: usize,
    pub timeout_secs: u64,
    pub grace_secs: u64,
    pub output_limit_bytes: usize,
    /// Extra penalty applied to screening-only effective scores.
    pub screening_haircut: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            command: vec!["evoloop-evaluate".to_string()],
            workers: 4,
            timeout_secs: 15 * 60,
            grace_secs: 5,
            output_limit_bytes: 100_000,
            screening_haircut: 0.0,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            baseline_score: None,
            min_delay_secs: 30,
            limits: LimitsConfig::default(),
            generator: GeneratorConfig::default(),
            evaluator: EvaluatorConfig::default(),
            gates: GateConfig::default(),
            scoring: ScoringPolicy::default(),
            exploration: ExplorationPolicy::default(),
            opportunities: Vec::new(),
        }
    }
}

/// Command-line overrides for `evoloop run`. `None` keeps the file value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOverrides {
    pub max_iterations: Option<u64>,
    pub max_runtime_secs: Option<u64>,
    pub target_score: Option<f64>,
    pub early_n: Option<usize>,
    pub early_delta: Option<f64>,
    pub batch_delta: Option<f64>,
    pub confirmations: Option<u32>,
    pub ewma_alpha: Option<f64>,
    pub ewma_penalty: Option<f64>,
    pub exploration_lookback: Option<usize>,
    pub exploration_epsilon: Option<f64>,
    pub stall_min_no_uplift: Option<usize>,
    pub workers: Option<usize>,
    pub min_delay_secs: Option<u64>,
    pub generation_timeout_secs: Option<u64>,
    pub baseline_score: Option<f64>,
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

impl LoopConfig {
    pub fn apply(&mut self, overrides: RunOverrides) {
        if overrides.max_iterations.is_some() {
            self.limits.max_iterations = overrides.max_iterations;
        }
        if overrides.max_runtime_secs.is_some() {
            self.limits.max_runtime_secs = overrides.max_runtime_secs;
        }
        if overrides.target_score.is_some() {
            self.limits.target_score = overrides.target_score;
        }
        if overrides.baseline_score.is_some() {
            self.baseline_score = overrides.baseline_score;
        }
        set(&mut self.gates.early_n, overrides.early_n);
        set(&mut self.gates.early_delta, overrides.early_delta);
        set(&mut self.gates.batch_delta, overrides.batch_delta);
        set(&mut self.gates.confirmations, overrides.confirmations);
        set(&mut self.scoring.ewma_alpha, overrides.ewma_alpha);
        set(&mut self.scoring.ewma_penalty, overrides.ewma_penalty);
        set(&mut self.exploration.lookback, overrides.exploration_lookback);
        set(&mut self.exploration.epsilon, overrides.exploration_epsilon);
        set(
            &mut self.exploration.stall_min_no_uplift,
            overrides.stall_min_no_uplift,
        );
        set(&mut self.evaluator.workers, overrides.workers);
        set(&mut self.min_delay_secs, overrides.min_delay_secs);
        set(
            &mut self.generator.timeout_secs,
            overrides.generation_timeout_secs,
        );
    }

    pub fn validate(&self) -> Result<()> {
        check_command("generator.command", &self.generator.command)?;
        check_command("evaluator.command", &self.evaluator.command)?;
        if self.generator.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        if self.evaluator.timeout_secs == 0 {
            return Err(anyhow!("evaluator.timeout_secs must be > 0"));
        }
        if self.generator.output_limit_bytes == 0 || self.evaluator.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.generator.prompt_budget_bytes == 0 {
            return Err(anyhow!("generator.prompt_budget_bytes must be > 0"));
        }
        if self.evaluator.workers == 0 {
            return Err(anyhow!("evaluator.workers must be >= 1"));
        }
        if self.gates.confirmations == 0 {
            return Err(anyhow!("gates.confirmations must be >= 1"));
        }
        check_non_negative("gates.early_delta", self.gates.early_delta)?;
        check_non_negative("gates.batch_delta", self.gates.batch_delta)?;
        check_non_negative(
            "evaluator.screening_haircut",
            self.evaluator.screening_haircut,
        )?;

        let alpha = self.scoring.ewma_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(anyhow!("scoring.ewma_alpha must be in (0, 1], got {alpha}"));
        }
        if self.scoring.ewma_spread <= 0.0 || !self.scoring.ewma_spread.is_finite() {
            return Err(anyhow!("scoring.ewma_spread must be > 0"));
        }
        check_non_negative("scoring.ewma_penalty", self.scoring.ewma_penalty)?;
        check_non_negative("scoring.recency_penalty", self.scoring.recency_penalty)?;
        if !(0.0..=1.0).contains(&self.scoring.sibling_weight) {
            return Err(anyhow!("scoring.sibling_weight must be in [0, 1]"));
        }
        for (label, value) in [
            ("scoring.ewma_threshold", self.scoring.ewma_threshold),
            ("exploration.epsilon", self.exploration.epsilon),
        ] {
            if !value.is_finite() {
                return Err(anyhow!("{label} must be finite, got {value}"));
            }
        }
        for (class, prior) in &self.scoring.novelty_priors {
            check_non_negative(&format!("scoring.novelty_priors.{class}"), *prior)?;
        }

        if self.exploration.lookback == 0 {
            return Err(anyhow!("exploration.lookback must be >= 1"));
        }
        if self.exploration.stall_min_no_uplift > self.exploration.lookback {
            return Err(anyhow!(
                "exploration.stall_min_no_uplift ({}) cannot exceed lookback ({})",
                self.exploration.stall_min_no_uplift,
                self.exploration.lookback
            ));
        }
        let overlap: Vec<&String> = self
            .exploration
            .recent_family_classes
            .intersection(&self.exploration.target_family_classes)
            .collect();
        if !overlap.is_empty() {
            return Err(anyhow!(
                "exploration.recent_family_classes and target_family_classes overlap: {overlap:?}"
            ));
        }

        let id_pattern = Regex::new(r"^[A-Za-z0-9._-]+$").context("compile id pattern")?;
        let mut seen = BTreeSet::new();
        for spec in &self.opportunities {
            for part in [&spec.family_class, &spec.subfamily] {
                if !id_pattern.is_match(part) {
                    return Err(anyhow!(
                        "opportunity component {part:?} must match {}",
                        id_pattern.as_str()
                    ));
                }
            }
            if !seen.insert(spec.id()) {
                return Err(anyhow!("duplicate opportunity {}", spec.id()));
            }
            if !spec.expected_uplift.is_finite() {
                return Err(anyhow!("opportunity {} expected_uplift must be finite", spec.id()));
            }
            if !(0.0..=1.0).contains(&spec.confidence) {
                return Err(anyhow!("opportunity {} confidence must be in [0, 1]", spec.id()));
            }
        }

        for (label, value) in [
            ("baseline_score", self.baseline_score),
            ("limits.target_score", self.limits.target_score),
        ] {
            if value.is_some_and(|v| !v.is_finite()) {
                return Err(anyhow!("{label} must be finite"));
            }
        }
        Ok(())
    }
}

fn check_command(label: &str, command: &[String]) -> Result<()> {
    match command.first() {
        Some(program) if !program.trim().is_empty() => Ok(()),
        _ => Err(anyhow!("{label} must be a non-empty array")),
    }
}

fn check_non_negative(label: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(anyhow!("{label} must be a finite value >= 0, got {value}"))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        return Ok(LoopConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
