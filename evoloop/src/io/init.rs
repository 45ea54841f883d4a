//! State directory scaffolding and self-repair.
//!
//! `init_state` is idempotent: valid documents are left byte-identical, and
//! missing or corrupt ones are rewritten with defaults. It runs for `init`
//! and again at the start of every `run`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use super::config::{LoopConfig, write_config};
use super::documents::{
    ChampionScore, GateAudit, IterationCounter, IterationLog, RateLimitState, StartTimestamp,
};
use super::store::{Document, RepairOutcome, StateStore};
use crate::core::opportunity::OpportunityBook;
use crate::core::promotion::PromotionLedger;
use crate::core::types::{Champion, IterationId, Watermarks};

/// Canonical paths within a state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub candidates_dir: PathBuf,
    pub config_path: PathBuf,
}

impl StatePaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            iterations_dir: dir.join("iterations"),
            candidates_dir: dir.join("candidates"),
            config_path: dir.join("config.toml"),
            dir,
        }
    }

    /// Use `path` instead of `<dir>/config.toml`.
    pub fn with_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }

    /// Per-iteration artifact directory (`iterations/<id>/`).
    pub fn iteration_dir(&self, id: IterationId) -> PathBuf {
        self.iterations_dir.join(id.to_string())
    }
}

/// What `init_state` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    pub documents: Vec<(&'static str, RepairOutcome)>,
    pub config_created: bool,
    pub seeded_champion: bool,
    pub reconciled_champion_score: bool,
    pub reconciled_counter: bool,
}

impl InitReport {
    /// Files that were created or repaired.
    pub fn changed(&self) -> Vec<&'static str> {
        self.documents
            .iter()
            .filter(|(_, outcome)| *outcome != RepairOutcome::Valid)
            .map(|(file, _)| *file)
            .collect()
    }

    pub fn repaired(&self) -> Vec<&'static str> {
        self.documents
            .iter()
            .filter(|(_, outcome)| *outcome == RepairOutcome::Repaired)
            .map(|(file, _)| *file)
            .collect()
    }

    pub fn is_noop(&self) -> bool {
        self.changed().is_empty()
            && !self.config_created
            && !self.seeded_champion
            && !self.reconciled_champion_score
            && !self.reconciled_counter
    }
}

fn repair<D: Document>(store: &StateStore, report: &mut InitReport) -> Result<()> {
    let outcome = store.repair::<D>()?;
    if outcome == RepairOutcome::Repaired {
        warn!(file = D::FILE, "repaired corrupt document to defaults");
    }
    report.documents.push((D::FILE, outcome));
    Ok(())
}

/// Create or repair the state directory at `dir`.
///
/// Seeds the champion from `baseline_score` when no champion score exists.
/// Fails only when the directory cannot be made usable.
pub fn init_state(dir: &Path, baseline_score: Option<f64>) -> Result<InitReport> {
    init_paths(&StatePaths::new(dir), baseline_score)
}

/// [`init_state`] with an explicit config location, which may live outside
/// the state directory.
pub fn init_paths(paths: &StatePaths, baseline_score: Option<f64>) -> Result<InitReport> {
    if paths.dir.exists() && !paths.dir.is_dir() {
        return Err(anyhow!(
            "state directory {} exists but is not a directory",
            paths.dir.display()
        ));
    }
    for sub in [&paths.dir, &paths.iterations_dir, &paths.candidates_dir] {
        fs::create_dir_all(sub).with_context(|| format!("create directory {}", sub.display()))?;
    }

    let store = StateStore::new(&paths.dir);
    let mut report = InitReport::default();
    repair::<IterationCounter>(&store, &mut report)?;
    repair::<ChampionScore>(&store, &mut report)?;
    repair::<StartTimestamp>(&store, &mut report)?;
    repair::<Champion>(&store, &mut report)?;
    repair::<Watermarks>(&store, &mut report)?;
    repair::<IterationLog>(&store, &mut report)?;
    repair::<OpportunityBook>(&store, &mut report)?;
    repair::<GateAudit>(&store, &mut report)?;
    repair::<PromotionLedger>(&store, &mut report)?;
    repair::<RateLimitState>(&store, &mut report)?;

    if !paths.config_path.exists() {
        let cfg = LoopConfig {
            baseline_score,
            ..LoopConfig::default()
        };
        write_config(&paths.config_path, &cfg)?;
        report.config_created = true;
    }

    let mut champion = store.read::<Champion>();
    if let (None, Some(baseline)) = (champion.effective_score, baseline_score) {
        info!(baseline, "seeding champion from baseline score");
        champion = Champion {
            effective_score: Some(baseline),
            raw_score: Some(baseline),
            candidate_ref: None,
            promoted_at_iteration: None,
        };
        store.write(&champion)?;
        report.seeded_champion = true;
    }

    // champion.json is authoritative for the scalar mirror.
    let scalar = store.read::<ChampionScore>();
    if scalar.0 != champion.effective_score {
        warn!(scalar = ?scalar.0, champion = ?champion.effective_score, "reconciling champion_score");
        store.write(&ChampionScore(champion.effective_score))?;
        report.reconciled_champion_score = true;
    }

    let counter = store.read::<IterationCounter>();
    if let Some(last) = store.read::<IterationLog>().last_id()
        && last > counter.0
    {
        warn!(counter = counter.0, last, "iteration counter behind log, advancing");
        store.write(&IterationCounter(last))?;
        report.reconciled_counter = true;
    }

    Ok(report)
}
