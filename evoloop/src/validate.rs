//! Consistency checks for `evoloop validate`.

use anyhow::Result;

use crate::core::guardrail::{StateSnapshot, check_consistency};
use crate::core::opportunity::OpportunityBook;
use crate::core::promotion::PromotionLedger;
use crate::core::types::{Champion, Watermarks};
use crate::io::config::load_config;
use crate::io::documents::{
    ChampionScore, GateAudit, IterationCounter, IterationLog, RateLimitState, StartTimestamp,
};
use crate::io::init::StatePaths;
use crate::io::store::{Document, StateStore};

/// High-level validation outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidateOutcome {
    /// Every problem found; empty means the state directory is consistent.
    pub problems: Vec<String>,
}

impl ValidateOutcome {
    pub fn is_consistent(&self) -> bool {
        self.problems.is_empty()
    }
}

fn strict<D: Document>(store: &StateStore, problems: &mut Vec<String>) -> D {
    match store.try_read::<D>() {
        Ok(Some(doc)) => doc,
        Ok(None) => {
            problems.push(format!("{} is missing", D::FILE));
            D::default()
        }
        Err(err) => {
            problems.push(format!("{err:#}"));
            D::default()
        }
    }
}

/// Check every document parses, the config is valid, and the canonical
/// documents agree with each other. Never modifies state.
pub fn validate_state(paths: &StatePaths) -> Result<ValidateOutcome> {
    let mut problems = Vec::new();
    if !paths.dir.is_dir() {
        problems.push(format!(
            "state directory {} does not exist (run `evoloop init`)",
            paths.dir.display()
        ));
        return Ok(ValidateOutcome { problems });
    }

    match load_config(&paths.config_path).and_then(|cfg| cfg.validate()) {
        Ok(()) => {}
        Err(err) => problems.push(format!("config: {err:#}")),
    }

    let store = StateStore::new(&paths.dir);
    let counter = strict::<IterationCounter>(&store, &mut problems);
    let scalar = strict::<ChampionScore>(&store, &mut problems);
    strict::<StartTimestamp>(&store, &mut problems);
    let champion = strict::<Champion>(&store, &mut problems);
    let watermarks = strict::<Watermarks>(&store, &mut problems);
    let log = strict::<IterationLog>(&store, &mut problems);
    strict::<OpportunityBook>(&store, &mut problems);
    strict::<GateAudit>(&store, &mut problems);
    let ledger = strict::<PromotionLedger>(&store, &mut problems);
    strict::<RateLimitState>(&store, &mut problems);

    problems.extend(check_consistency(&StateSnapshot {
        iteration_counter: counter.0,
        champion_score: scalar.0,
        champion: &champion,
        watermarks: &watermarks,
        ledger: &ledger,
        last_logged_id: log.last_id(),
    }));
    Ok(ValidateOutcome { problems })
}
