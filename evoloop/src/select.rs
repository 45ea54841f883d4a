//! Plan preview for `evoloop select`.

use anyhow::Result;
use serde::Serialize;

use crate::core::opportunity::{OpportunityBook, OpportunityScorer};
use crate::core::types::{IterationId, Plan};
use crate::io::config::LoopConfig;
use crate::io::documents::IterationCounter;
use crate::io::init::StatePaths;
use crate::io::store::StateStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankingLine {
    pub id: String,
    pub score: f64,
}

/// What the next iteration would be asked to do.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectReport {
    pub iteration: IterationId,
    pub plan: Plan,
    pub stall_detected: bool,
    pub no_uplift_count: usize,
    pub ranking: Vec<RankingLine>,
}

/// Compute the next plan without mutating any state.
pub fn select_next(paths: &StatePaths, config: &LoopConfig) -> Result<SelectReport> {
    let store = StateStore::new(&paths.dir);
    let iteration = store.read::<IterationCounter>().0 + 1;
    let book = store.read::<OpportunityBook>();
    let scorer = OpportunityScorer::new(
        &config.opportunities,
        &config.scoring,
        &config.exploration,
    );
    let ranking = scorer
        .rank(&book, iteration)
        .into_iter()
        .map(|ranked| RankingLine {
            id: ranked.id,
            score: ranked.score,
        })
        .collect();
    Ok(SelectReport {
        iteration,
        plan: scorer.select(&book, iteration),
        stall_detected: scorer.stall_detected(&book),
        no_uplift_count: scorer.no_uplift_count(&book),
        ranking,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::opportunity::{OpportunitySpec, OutcomeVerdict};
    use crate::core::types::PlanMode;
    use crate::test_support::TestState;

    fn spec(family: &str, sub: &str, uplift: f64) -> OpportunitySpec {
        OpportunitySpec {
            family_class: family.to_string(),
            subfamily: sub.to_string(),
            expected_uplift: uplift,
            confidence: 1.0,
            description: String::new(),
        }
    }

    #[test]
    fn select_does_not_write_state() {
        let state = TestState::new(Some(1.0)).expect("state");
        let mut config = state.config();
        config.opportunities = vec![spec("a", "x", 1.0), spec("b", "y", 2.0)];
        let before = fs::read(state.store.path::<OpportunityBook>()).expect("read");

        let report = select_next(&state.paths, &config).expect("select");
        assert_eq!(report.iteration, 1);
        assert_eq!(report.plan.opportunity_id.as_deref(), Some("b/y"));
        assert_eq!(report.ranking.len(), 2);
        assert_eq!(
            fs::read(state.store.path::<OpportunityBook>()).expect("read"),
            before
        );
    }

    #[test]
    fn stall_forces_target_class() {
        let state = TestState::new(Some(1.0)).expect("state");
        let mut config = state.config();
        config.opportunities = vec![spec("hot", "x", 5.0), spec("cold", "y", 1.0)];
        config.exploration.recent_family_classes = ["hot".to_string()].into();
        config.exploration.target_family_classes = ["cold".to_string()].into();
        let book = OpportunityBook {
            outcome_window: (1..=8)
                .map(|iteration| OutcomeVerdict {
                    iteration,
                    delta: Some(-1.0),
                    uplift: iteration > 6,
                })
                .collect(),
            ..OpportunityBook::default()
        };
        state.store.write(&book).expect("write book");

        let report = select_next(&state.paths, &config).expect("select");
        assert!(report.stall_detected);
        assert_eq!(report.no_uplift_count, 6);
        assert_eq!(report.plan.mode, PlanMode::Explore);
        assert_eq!(report.plan.family_class.as_deref(), Some("cold"));
    }
}
