//! Content-addressed, multi-confirmation promotion decisions.
//!
//! A candidate identity (content hash) moves through
//! `unconfirmed -> confirmations accumulate -> promoted`. All functions here are
//! pure; `promote.rs` persists the resulting documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::types::{Champion, IterationId, PromotionGateRecord, Watermarks};

/// One iteration's confirmation of a candidate's superiority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub iteration: IterationId,
    pub effective_score: f64,
}

/// Ledger state for one content hash. Retained after promotion for audit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(default)]
    pub confirmations: Vec<Confirmation>,
    #[serde(default)]
    pub best_effective_score: Option<f64>,
    #[serde(default)]
    pub promoted_at_iteration: Option<IterationId>,
}

impl LedgerEntry {
    pub fn confirmation_count(&self) -> u32 {
        u32::try_from(self.confirmations.len()).unwrap_or(u32::MAX)
    }

    /// Records a confirmation unless this iteration already confirmed.
    /// Returns `true` when the count advanced.
    pub fn confirm(&mut self, iteration: IterationId, effective_score: f64) -> bool {
        if self
            .confirmations
            .iter()
            .any(|confirmation| confirmation.iteration == iteration)
        {
            return false;
        }
        self.confirmations.push(Confirmation {
            iteration,
            effective_score,
        });
        self.confirmations.sort_by_key(|confirmation| confirmation.iteration);
        self.best_effective_score = Some(
            self.best_effective_score
                .map_or(effective_score, |best| best.max(effective_score)),
        );
        true
    }
}

/// Promotion ledger keyed by candidate content hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromotionLedger {
    #[serde(default)]
    pub entries: BTreeMap<String, LedgerEntry>,
}

/// Inputs describing one evaluated iteration result.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionRequest {
    pub iteration: IterationId,
    pub content_hash: String,
    pub effective_score: f64,
    pub raw_score: f64,
    /// Whether the effective score is derived from an authoritative evaluation.
    pub authoritative: bool,
    /// Whether this iteration's batch-fail gate already failed.
    pub batch_failed: bool,
}

/// Verdict of [`decide`].
#[derive(Debug, Clone, PartialEq)]
pub enum PromotionDecision {
    /// The score does not beat the champion; nothing is recorded.
    NotBetter,
    /// The candidate already is the champion.
    AlreadyChampion,
    /// Beats the champion but may not replace it (yet).
    Blocked {
        reason: String,
        confirmations: u32,
        required: u32,
    },
    /// Replace the champion with this candidate.
    Promoted { confirmations: u32, required: u32 },
}

impl PromotionDecision {
    pub fn is_promoted(&self) -> bool {
        matches!(self, PromotionDecision::Promoted { .. })
    }

    /// Audit record for the execution-gate document.
    pub fn gate_record(&self, required: u32) -> PromotionGateRecord {
        match self {
            PromotionDecision::NotBetter => PromotionGateRecord {
                blocked: false,
                reason: Some("does not beat champion".to_string()),
                confirmations: 0,
                required,
            },
            PromotionDecision::AlreadyChampion => PromotionGateRecord {
                blocked: false,
                reason: Some("candidate is already champion".to_string()),
                confirmations: 0,
                required,
            },
            PromotionDecision::Blocked {
                reason,
                confirmations,
                required,
            } => PromotionGateRecord {
                blocked: true,
                reason: Some(reason.clone()),
                confirmations: *confirmations,
                required: *required,
            },
            PromotionDecision::Promoted {
                confirmations,
                required,
            } => PromotionGateRecord {
                blocked: false,
                reason: None,
                confirmations: *confirmations,
                required: *required,
            },
        }
    }
}

/// True when `score` strictly beats the champion, or there is no champion yet.
pub fn beats(score: f64, champion: &Champion) -> bool {
    champion
        .effective_score
        .is_none_or(|current| score > current)
}

/// Apply the confirmation state machine for one request.
///
/// Mutates `ledger` only when a confirmation is recorded. With `required == 1`
/// the confirmation is still recorded so the ledger covers every promotion.
pub fn decide(
    ledger: &mut PromotionLedger,
    champion: &Champion,
    request: &PromotionRequest,
    required: u32,
) -> PromotionDecision {
    let required = required.max(1);
    if !beats(request.effective_score, champion) {
        return PromotionDecision::NotBetter;
    }
    if champion.candidate_ref.as_deref() == Some(request.content_hash.as_str()) {
        return PromotionDecision::AlreadyChampion;
    }
    if request.batch_failed {
        let confirmations = ledger
            .entries
            .get(&request.content_hash)
            .map_or(0, LedgerEntry::confirmation_count);
        return PromotionDecision::Blocked {
            reason: "batch-fail gate failed".to_string(),
            confirmations,
            required,
        };
    }
    if required > 1 && !request.authoritative {
        let confirmations = ledger
            .entries
            .get(&request.content_hash)
            .map_or(0, LedgerEntry::confirmation_count);
        return PromotionDecision::Blocked {
            reason: format!(
                "screening-only score cannot confirm: pending: {confirmations}/{required}"
            ),
            confirmations,
            required,
        };
    }

    let entry = ledger
        .entries
        .entry(request.content_hash.clone())
        .or_default();
    entry.confirm(request.iteration, request.effective_score);
    let confirmations = entry.confirmation_count();
    if confirmations >= required {
        entry.promoted_at_iteration = Some(request.iteration);
        PromotionDecision::Promoted {
            confirmations,
            required,
        }
    } else {
        PromotionDecision::Blocked {
            reason: format!("pending: {confirmations}/{required}"),
            confirmations,
            required,
        }
    }
}

/// Champion value after a promotion. The promoted score is the promoting
/// iteration's score, not the ledger's best.
pub fn promoted_champion(request: &PromotionRequest) -> Champion {
    Champion {
        effective_score: Some(request.effective_score),
        raw_score: Some(request.raw_score),
        candidate_ref: Some(request.content_hash.clone()),
        promoted_at_iteration: Some(request.iteration),
    }
}

fn raise(
    best: &mut Option<f64>,
    best_ref: &mut Option<String>,
    best_iteration: &mut Option<IterationId>,
    score: f64,
    request: &PromotionRequest,
) -> bool {
    if best.is_some_and(|current| current >= score) {
        return false;
    }
    *best = Some(score);
    *best_ref = Some(request.content_hash.clone());
    *best_iteration = Some(request.iteration);
    true
}

/// Raise the effective and raw watermarks independently. Returns `true` when
/// either moved.
pub fn update_watermarks(watermarks: &mut Watermarks, request: &PromotionRequest) -> bool {
    let effective = raise(
        &mut watermarks.best_effective_score,
        &mut watermarks.best_effective_ref,
        &mut watermarks.best_effective_iteration,
        request.effective_score,
        request,
    );
    let raw = raise(
        &mut watermarks.best_raw_score,
        &mut watermarks.best_raw_ref,
        &mut watermarks.best_raw_iteration,
        request.raw_score,
        request,
    );
    effective || raw
}
