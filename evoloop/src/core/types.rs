//! Shared deterministic types for the control core.
//!
//! These types are the persisted vocabulary of the loop: every document in the
//! state directory is built from them, so field names are part of the on-disk
//! format and must stay stable.

use serde::{Deserialize, Serialize};

/// Monotonic, 1-based iteration identifier.
pub type IterationId = u64;

/// Terminal status of an iteration as recorded in the iteration log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    /// The pipeline ran to the promotion decision (promoted or not).
    Completed,
    /// A pipeline stage failed.
    Failed,
    /// An execution gate deliberately stopped the iteration early.
    Aborted,
    /// The iteration was skipped before prompt construction.
    Skipped,
    /// The process died mid-iteration; reconciled on the next startup.
    Interrupted,
}

/// Pipeline stage at which an iteration stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    PromptFailed,
    GenerationFailed,
    ExtractFailed,
    TestFailed,
    GateAbort,
    KnowledgeGuardrailFailed,
    Interrupted,
}

impl ErrorStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorStage::PromptFailed => "prompt_failed",
            ErrorStage::GenerationFailed => "generation_failed",
            ErrorStage::ExtractFailed => "extract_failed",
            ErrorStage::TestFailed => "test_failed",
            ErrorStage::GateAbort => "gate_abort",
            ErrorStage::KnowledgeGuardrailFailed => "knowledge_guardrail_failed",
            ErrorStage::Interrupted => "interrupted",
        }
    }

    /// Terminal iteration status implied by stopping at this stage.
    pub fn status(self) -> IterationStatus {
        match self {
            ErrorStage::GateAbort => IterationStatus::Aborted,
            ErrorStage::KnowledgeGuardrailFailed => IterationStatus::Skipped,
            ErrorStage::Interrupted => IterationStatus::Interrupted,
            ErrorStage::PromptFailed
            | ErrorStage::GenerationFailed
            | ErrorStage::ExtractFailed
            | ErrorStage::TestFailed => IterationStatus::Failed,
        }
    }
}

/// Stage-tagged failure recorded on an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationError {
    pub stage: ErrorStage,
    pub message: String,
}

/// One entry of the append-only iteration log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub id: IterationId,
    pub status: IterationStatus,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub duration_ms: Option<u64>,
    pub opportunity_id: Option<String>,
    /// Content hash of the evaluated candidate.
    pub candidate_ref: Option<String>,
    /// Path (relative to the state dir) of the iteration's `result.json`.
    pub result_ref: Option<String>,
    pub effective_score: Option<f64>,
    pub promoted: bool,
    pub error: Option<IterationError>,
}

/// A generated solution, identified by its content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub content: String,
    pub content_hash: String,
    pub produced_by_iteration: IterationId,
    pub name: String,
    pub hypothesis_tags: Vec<String>,
    pub expected_range: Option<[f64; 2]>,
    /// Subfamily the generator claims to have implemented.
    pub subfamily: Option<String>,
}

/// Scores derived from one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub screening_score: f64,
    pub authoritative_score: Option<f64>,
    pub robustness_adjustment: f64,
    /// The only quantity compared against the champion.
    pub effective_score: f64,
    /// Unadjusted domain score (authoritative when present).
    pub raw_score: f64,
    /// Subfamily the evaluator observed the candidate actually using.
    pub observed_subfamily: Option<String>,
}

impl EvaluationResult {
    /// Derive effective/raw scores from evaluator output.
    ///
    /// With an authoritative score: `authoritative - adjustment`. Screening-only
    /// results additionally pay `screening_haircut`.
    pub fn derive(
        screening_score: f64,
        authoritative_score: Option<f64>,
        robustness_adjustment: f64,
        screening_haircut: f64,
        observed_subfamily: Option<String>,
    ) -> Self {
        let (effective_score, raw_score) = match authoritative_score {
            Some(auth) => (auth - robustness_adjustment, auth),
            None => (
                screening_score - robustness_adjustment - screening_haircut,
                screening_score,
            ),
        };
        Self {
            screening_score,
            authoritative_score,
            robustness_adjustment,
            effective_score,
            raw_score,
            observed_subfamily,
        }
    }

    pub fn is_authoritative(&self) -> bool {
        self.authoritative_score.is_some()
    }
}

/// The currently promoted best-known candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Champion {
    pub effective_score: Option<f64>,
    pub raw_score: Option<f64>,
    pub candidate_ref: Option<String>,
    pub promoted_at_iteration: Option<IterationId>,
}

/// Best scores ever observed, independent of promotion. The effective and
/// raw watermarks are raised separately and may point at different candidates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Watermarks {
    pub best_effective_score: Option<f64>,
    pub best_effective_ref: Option<String>,
    pub best_effective_iteration: Option<IterationId>,
    pub best_raw_score: Option<f64>,
    pub best_raw_ref: Option<String>,
    pub best_raw_iteration: Option<IterationId>,
}

/// Whether a plan exploits the ranking or was forced into exploration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    Exploit,
    Explore,
}

/// Structured plan emitted by the opportunity scorer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub opportunity_id: Option<String>,
    pub family_class: Option<String>,
    pub subfamily: Option<String>,
    pub mode: PlanMode,
    /// When false the generator works free-form and no opportunity is credited.
    pub execute_this_iteration: bool,
    pub rationale: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarlyAbortRecord {
    pub triggered: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchGateRecord {
    pub count: usize,
    pub best_score: Option<f64>,
    pub failed: bool,
    pub fail_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionGateRecord {
    pub blocked: bool,
    pub reason: Option<String>,
    pub confirmations: u32,
    pub required: u32,
}

/// Write-once audit of every gate decision taken in one iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionGateRecord {
    pub early_abort: EarlyAbortRecord,
    pub batch: BatchGateRecord,
    pub promotion_gate: PromotionGateRecord,
}
