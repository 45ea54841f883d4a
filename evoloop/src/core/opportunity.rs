//! Opportunity ranking, EWMA outcome tracking, and stall-driven exploration.
//!
//! The catalog of opportunities is configuration; the mutable statistics live
//! in an [`OpportunityBook`] persisted as `opportunity_priors.json`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::types::{IterationId, IterationStatus, Plan, PlanMode};

/// One configured opportunity: a family/subfamily the generator may target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunitySpec {
    pub family_class: String,
    pub subfamily: String,
    #[serde(default = "default_expected_uplift")]
    pub expected_uplift: f64,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub description: String,
}

fn default_expected_uplift() -> f64 {
    1.0
}

fn default_confidence() -> f64 {
    0.5
}

impl OpportunitySpec {
    pub fn id(&self) -> String {
        format!("{}/{}", self.family_class, self.subfamily)
    }
}

/// Ranking knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    /// EWMA smoothing factor in `(0, 1]`.
    pub ewma_alpha: f64,
    /// Families whose EWMA delta falls below this are penalized.
    pub ewma_threshold: f64,
    pub ewma_spread: f64,
    pub ewma_penalty: f64,
    pub novelty_lookback: u64,
    pub recency_penalty: f64,
    /// Fraction of `ewma_alpha` applied to siblings in the same family class (0 disables).
    pub sibling_weight: f64,
    /// Per-family-class novelty prior; classes not listed use 1.0.
    pub novelty_priors: BTreeMap<String, f64>,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.3,
            ewma_threshold: 0.0,
            ewma_spread: 1.0,
            ewma_penalty: 1.0,
            novelty_lookback: 3,
            recency_penalty: 0.25,
            sibling_weight: 0.0,
            novelty_priors: BTreeMap::new(),
        }
    }
}

/// Stall detection and the hard diversification floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorationPolicy {
    pub lookback: usize,
    /// A delta must exceed this to count as uplift.
    pub epsilon: f64,
    pub stall_min_no_uplift: usize,
    /// Classes that have been repeated recently; never chosen by the override.
    pub recent_family_classes: BTreeSet<String>,
    /// Classes the override forces selection into.
    pub target_family_classes: BTreeSet<String>,
}

impl Default for ExplorationPolicy {
    fn default() -> Self {
        Self {
            lookback: 8,
            epsilon: 0.0,
            stall_min_no_uplift: 6,
            recent_family_classes: BTreeSet::new(),
            target_family_classes: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConformanceStats {
    pub required: u64,
    pub matched: u64,
}

impl ConformanceStats {
    /// `matched / required`, or `None` before any plan-bound outcome.
    pub fn score(&self) -> Option<f64> {
        (self.required > 0).then(|| self.matched as f64 / self.required as f64)
    }
}

/// Outcome statistics for one opportunity. Decayed, never deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpportunityRecord {
    pub ewma_delta: f64,
    pub ewma_count: u64,
    pub recent_selection_window: Vec<IterationId>,
    pub conformance_stats: ConformanceStats,
}

impl OpportunityRecord {
    fn apply_delta(&mut self, alpha: f64, delta: f64) {
        self.ewma_delta = alpha * delta + (1.0 - alpha) * self.ewma_delta;
        self.ewma_count += 1;
    }
}

/// One recorded outcome's uplift verdict, kept for stall detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeVerdict {
    pub iteration: IterationId,
    pub delta: Option<f64>,
    pub uplift: bool,
}

/// Persisted scorer state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpportunityBook {
    pub records: BTreeMap<String, OpportunityRecord>,
    pub outcome_window: Vec<OutcomeVerdict>,
}

/// What an iteration learned about its plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutcomeSample {
    /// `effective_score - champion_before`, when an evaluation happened.
    pub delta: Option<f64>,
    pub observed_subfamily: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedOpportunity<'a> {
    pub id: String,
    pub score: f64,
    pub spec: &'a OpportunitySpec,
}

/// Stateless scorer over a borrowed catalog and policy.
#[derive(Debug, Clone, Copy)]
pub struct OpportunityScorer<'a> {
    pub catalog: &'a [OpportunitySpec],
    pub scoring: &'a ScoringPolicy,
    pub exploration: &'a ExplorationPolicy,
}

impl<'a> OpportunityScorer<'a> {
    pub fn new(
        catalog: &'a [OpportunitySpec],
        scoring: &'a ScoringPolicy,
        exploration: &'a ExplorationPolicy,
    ) -> Self {
        Self {
            catalog,
            scoring,
            exploration,
        }
    }

    /// Ranking score of one opportunity as of `iteration`.
    pub fn score(
        &self,
        spec: &OpportunitySpec,
        record: Option<&OpportunityRecord>,
        iteration: IterationId,
    ) -> f64 {
        let novelty = self
            .scoring
            .novelty_priors
            .get(&spec.family_class)
            .copied()
            .unwrap_or(1.0);
        let mut score = spec.expected_uplift * spec.confidence * novelty;
        let Some(record) = record else {
            return score;
        };
        if record.ewma_count > 0 && record.ewma_delta < self.scoring.ewma_threshold {
            let spread = if self.scoring.ewma_spread > 0.0 {
                self.scoring.ewma_spread
            } else {
                1.0
            };
            let shortfall = ((self.scoring.ewma_threshold - record.ewma_delta) / spread).max(0.0);
            score -= self.scoring.ewma_penalty * shortfall;
        }
        if self.selected_recently(record, iteration) {
            score -= self.scoring.recency_penalty;
        }
        score
    }

    fn selected_recently(&self, record: &OpportunityRecord, iteration: IterationId) -> bool {
        record.recent_selection_window.iter().any(|&selected| {
            selected < iteration && iteration - selected <= self.scoring.novelty_lookback
        })
    }

    /// Catalog ordered best-first; ties break by opportunity id.
    pub fn rank(&self, book: &OpportunityBook, iteration: IterationId) -> Vec<RankedOpportunity<'a>> {
        let mut ranked: Vec<RankedOpportunity<'a>> = self
            .catalog
            .iter()
            .map(|spec| {
                let id = spec.id();
                let score = self.score(spec, book.records.get(&id), iteration);
                RankedOpportunity { id, score, spec }
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked
    }

    /// Number of no-uplift verdicts in the last `lookback` outcomes.
    pub fn no_uplift_count(&self, book: &OpportunityBook) -> usize {
        let lookback = self.exploration.lookback;
        let skip = book.outcome_window.len().saturating_sub(lookback);
        book.outcome_window
            .iter()
            .skip(skip)
            .filter(|verdict| !verdict.uplift)
            .count()
    }

    pub fn stall_detected(&self, book: &OpportunityBook) -> bool {
        self.exploration.stall_min_no_uplift > 0
            && self.no_uplift_count(book) >= self.exploration.stall_min_no_uplift
    }

    fn is_exploration_target(&self, family_class: &str) -> bool {
        if self.exploration.recent_family_classes.contains(family_class) {
            return false;
        }
        self.exploration.target_family_classes.is_empty()
            || self.exploration.target_family_classes.contains(family_class)
    }

    /// Choose the next plan.
    pub fn select(&self, book: &OpportunityBook, iteration: IterationId) -> Plan {
        let ranked = self.rank(book, iteration);
        let Some(top) = ranked.first() else {
            return Plan {
                opportunity_id: None,
                family_class: None,
                subfamily: None,
                mode: PlanMode::Exploit,
                execute_this_iteration: false,
                rationale: "no opportunities configured; free-form generation".to_string(),
            };
        };

        if self.stall_detected(book) {
            let no_uplift = self.no_uplift_count(book);
            let lookback = self.exploration.lookback;
            if let Some(target) = ranked
                .iter()
                .find(|candidate| self.is_exploration_target(&candidate.spec.family_class))
            {
                let rationale = format!(
                    "stall: {no_uplift}/{lookback} recent outcomes without uplift; forced into target class {} (score {:.3}, top was {} at {:.3})",
                    target.spec.family_class, target.score, top.id, top.score
                );
                return plan_for(target, PlanMode::Explore, rationale);
            }
            let rationale = format!(
                "stall: {no_uplift}/{lookback} recent outcomes without uplift but no target-class opportunity configured; using top ranked (score {:.3})",
                top.score
            );
            return plan_for(top, PlanMode::Exploit, rationale);
        }

        let rationale = format!("top ranked (score {:.3})", top.score);
        plan_for(top, PlanMode::Exploit, rationale)
    }

    /// Fold one iteration's outcome into the book.
    pub fn record(
        &self,
        book: &mut OpportunityBook,
        iteration: IterationId,
        status: IterationStatus,
        plan: &Plan,
        sample: &OutcomeSample,
    ) {
        if matches!(
            status,
            IterationStatus::Skipped | IterationStatus::Interrupted
        ) {
            return;
        }

        let uplift = sample
            .delta
            .is_some_and(|delta| delta > self.exploration.epsilon);
        book.outcome_window.push(OutcomeVerdict {
            iteration,
            delta: sample.delta,
            uplift,
        });
        let excess = book
            .outcome_window
            .len()
            .saturating_sub(self.exploration.lookback.max(1));
        book.outcome_window.drain(..excess);

        if !plan.execute_this_iteration {
            return;
        }
        let Some(opportunity_id) = plan.opportunity_id.as_deref() else {
            return;
        };

        let lookback = self.scoring.novelty_lookback;
        let alpha = self.scoring.ewma_alpha;
        let record = book.records.entry(opportunity_id.to_string()).or_default();
        record.recent_selection_window.push(iteration);
        record
            .recent_selection_window
            .retain(|&selected| iteration - selected.min(iteration) < lookback.max(1));
        if let Some(delta) = sample.delta {
            record.apply_delta(alpha, delta);
        }
        if let (Some(planned), Some(observed)) =
            (plan.subfamily.as_deref(), sample.observed_subfamily.as_deref())
        {
            record.conformance_stats.required += 1;
            if planned == observed {
                record.conformance_stats.matched += 1;
            }
        }

        let (Some(delta), Some(family_class)) = (sample.delta, plan.family_class.as_deref()) else {
            return;
        };
        if self.scoring.sibling_weight <= 0.0 {
            return;
        }
        let sibling_alpha = (alpha * self.scoring.sibling_weight).min(1.0);
        for spec in self
            .catalog
            .iter()
            .filter(|spec| spec.family_class == family_class)
        {
            let id = spec.id();
            if id == opportunity_id {
                continue;
            }
            book.records
                .entry(id)
                .or_default()
                .apply_delta(sibling_alpha, delta);
        }
    }
}

fn plan_for(ranked: &RankedOpportunity<'_>, mode: PlanMode, rationale: String) -> Plan {
    Plan {
        opportunity_id: Some(ranked.id.clone()),
        family_class: Some(ranked.spec.family_class.clone()),
        subfamily: Some(ranked.spec.subfamily.clone()),
        mode,
        execute_this_iteration: true,
        rationale,
    }
}
