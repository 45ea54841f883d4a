//! Orchestration for a single iteration.
//!
//! Stages run in order: guardrail, plan, prompt, generate, extract, evaluate,
//! promote, record. Every per-iteration fault is captured as an
//! [`IterationError`] tagged with its stage; only state-store I/O failures are
//! returned as `Err`. The log entry is the iteration's commit point and is
//! written last.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::batch::{BatchReport, BatchSettings, Variant, run_batch};
use crate::core::guardrail::{StateSnapshot, check_consistency};
use crate::core::hash::{content_hash, short_hash};
use crate::core::opportunity::{OpportunityBook, OpportunityScorer, OutcomeSample};
use crate::core::promotion::{PromotionLedger, PromotionRequest, beats};
use crate::core::types::{
    Candidate, Champion, ErrorStage, EvaluationResult, ExecutionGateRecord, IterationError,
    IterationId, IterationRecord, IterationStatus, Plan, Watermarks,
};
use crate::generate::{GenerationOutcome, generate};
use crate::io::config::LoopConfig;
use crate::io::documents::{ChampionScore, GateAudit, IterationCounter, IterationLog};
use crate::io::evaluator::{EvalRequest, EvalTier, Evaluator};
use crate::io::generator::{Artifact, GenerateRequest, Generator};
use crate::io::init::StatePaths;
use crate::io::prompt::{OpportunityLine, PromptBuilder, PromptInputs};
use crate::io::store::{StateStore, to_json_pretty, write_atomic};
use crate::promote::PromotionController;

pub const PROMPT_FILE: &str = "prompt.md";
pub const ARTIFACT_FILE: &str = "artifact.json";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const RESULT_FILE: &str = "result.json";

/// Opportunity statistics lines shown to the generator.
const PROMPT_OPPORTUNITY_LINES: usize = 12;

/// External collaborators used by one iteration.
#[derive(Clone)]
pub struct Collaborators<'a> {
    pub generator: &'a dyn Generator,
    pub evaluator: Arc<dyn Evaluator>,
}

/// Result of a single iteration.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub record: IterationRecord,
    pub gates: ExecutionGateRecord,
    pub plan: Option<Plan>,
    /// Champion effective score after this iteration.
    pub champion_score: Option<f64>,
}

/// A failure attributed to one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageError {
    pub stage: ErrorStage,
    pub message: String,
}

impl StageError {
    fn new(stage: ErrorStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

trait StageContext<T> {
    fn stage(self, stage: ErrorStage) -> Result<T, StageError>;
}

impl<T> StageContext<T> for Result<T> {
    fn stage(self, stage: ErrorStage) -> Result<T, StageError> {
        self.map_err(|err| StageError::new(stage, format!("{err:#}")))
    }
}

/// What the pipeline accumulated before it finished or stopped.
#[derive(Debug, Default)]
struct Progress {
    plan: Option<Plan>,
    candidate: Option<Candidate>,
    result: Option<EvaluationResult>,
    batch: Option<BatchReport>,
    recovered_from_checkpoint: bool,
    gates: ExecutionGateRecord,
}

#[derive(Serialize)]
struct CandidateSummary<'a> {
    name: &'a str,
    content_hash: &'a str,
    hypothesis_tags: &'a [String],
    expected_range: Option<[f64; 2]>,
    subfamily: Option<&'a str>,
    path: PathBuf,
}

#[derive(Serialize)]
struct IterationResultDoc<'a> {
    iteration: IterationId,
    status: IterationStatus,
    plan: Option<&'a Plan>,
    candidate: Option<CandidateSummary<'a>>,
    recovered_from_checkpoint: bool,
    evaluation: Option<&'a EvaluationResult>,
    batch: Option<&'a BatchReport>,
    champion_before: Option<f64>,
    champion_after: Option<f64>,
    promoted: bool,
    gates: &'a ExecutionGateRecord,
    error: Option<&'a IterationError>,
}

struct Iteration<'a> {
    id: IterationId,
    paths: &'a StatePaths,
    store: StateStore,
    config: &'a LoopConfig,
    collaborators: &'a Collaborators<'a>,
    dir: PathBuf,
    champion: Champion,
}

/// Run iteration `id`, which the caller has already claimed in the counter.
#[instrument(skip_all, fields(iteration = id))]
pub async fn run_iteration(
    paths: &StatePaths,
    config: &LoopConfig,
    collaborators: &Collaborators<'_>,
    id: IterationId,
) -> Result<StepOutcome> {
    let started = Instant::now();
    let started_at = Utc::now().to_rfc3339();
    let dir = paths.iteration_dir(id);
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let store = StateStore::new(&paths.dir);
    let champion = store.read::<Champion>();

    let iteration = Iteration {
        id,
        paths,
        store,
        config,
        collaborators,
        dir,
        champion,
    };
    let mut progress = Progress::default();
    let halted = iteration.pipeline(&mut progress).await.err();
    iteration.finish(progress, halted, started, started_at)
}

impl Iteration<'_> {
    async fn pipeline(&self, progress: &mut Progress) -> Result<(), StageError> {
        self.guardrail()?;

        let scorer = self.scorer();
        let book = self.store.read::<OpportunityBook>();
        let plan = scorer.select(&book, self.id);
        info!(opportunity = ?plan.opportunity_id, mode = ?plan.mode, rationale = %plan.rationale, "plan selected");
        progress.plan = Some(plan.clone());

        let prompt = self
            .build_prompt(&plan, &book)
            .stage(ErrorStage::PromptFailed)?;

        let request = GenerateRequest {
            iteration: self.id,
            prompt,
            plan,
            artifact_path: self.dir.join(ARTIFACT_FILE),
            checkpoint_path: self.dir.join(CHECKPOINT_FILE),
            timeout: Duration::from_secs(self.config.generator.timeout_secs),
            grace: Duration::from_secs(self.config.generator.grace_secs),
        };
        let report = generate(
            self.collaborators.generator,
            &request,
            self.champion.effective_score,
            &self.config.gates,
            &self.dir,
        )
        .await
        .stage(ErrorStage::GenerationFailed)?;
        progress.gates.early_abort = report.early_abort.clone();
        let artifact = match report.outcome {
            GenerationOutcome::Produced {
                artifact,
                recovered_from_checkpoint,
            } => {
                progress.recovered_from_checkpoint = recovered_from_checkpoint;
                artifact
            }
            GenerationOutcome::EarlyAbort { reason } => {
                return Err(StageError::new(ErrorStage::GateAbort, reason));
            }
            GenerationOutcome::Failed { reason } => {
                return Err(StageError::new(ErrorStage::GenerationFailed, reason));
            }
            GenerationOutcome::Unparseable { reason } => {
                return Err(StageError::new(ErrorStage::ExtractFailed, reason));
            }
        };

        let (primary, variants) = self.extract(&artifact)?;
        progress.candidate = Some(primary);

        if variants.len() > 1 {
            self.evaluate_family(variants, progress).await
        } else {
            self.evaluate_single(progress).await
        }
    }

    fn guardrail(&self) -> Result<(), StageError> {
        let watermarks = self.store.read::<Watermarks>();
        let ledger = self.store.read::<PromotionLedger>();
        let snapshot = StateSnapshot {
            iteration_counter: self.store.read::<IterationCounter>().0,
            champion_score: self.store.read::<ChampionScore>().0,
            champion: &self.champion,
            watermarks: &watermarks,
            ledger: &ledger,
            last_logged_id: self.store.read::<IterationLog>().last_id(),
        };
        let violations = check_consistency(&snapshot);
        if violations.is_empty() {
            return Ok(());
        }
        warn!(?violations, "canonical state inconsistent, skipping iteration");
        Err(StageError::new(
            ErrorStage::KnowledgeGuardrailFailed,
            violations.join("; "),
        ))
    }

    fn scorer(&self) -> OpportunityScorer<'_> {
        OpportunityScorer::new(
            &self.config.opportunities,
            &self.config.scoring,
            &self.config.exploration,
        )
    }

    fn build_prompt(&self, plan: &Plan, book: &OpportunityBook) -> Result<String> {
        let scorer = self.scorer();
        let opportunities = scorer
            .rank(book, self.id)
            .into_iter()
            .take(PROMPT_OPPORTUNITY_LINES)
            .map(|ranked| {
                let record = book.records.get(&ranked.id).cloned().unwrap_or_default();
                OpportunityLine {
                    score: ranked.score,
                    ewma_delta: record.ewma_delta,
                    ewma_count: record.ewma_count,
                    conformance: record.conformance_stats.score(),
                    id: ranked.id,
                }
            })
            .collect();
        let opportunity_description = plan.opportunity_id.as_deref().and_then(|id| {
            self.config
                .opportunities
                .iter()
                .find(|spec| spec.id() == id)
                .map(|spec| spec.description.clone())
        });
        let champion_source = self
            .champion
            .candidate_ref
            .as_deref()
            .map(|hash| self.store.candidate_path(hash))
            .filter(|path| path.exists())
            .map(|path| {
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
            })
            .transpose()?;
        let log = self.store.read::<IterationLog>();
        let inputs = PromptInputs {
            iteration: self.id,
            plan: plan.clone(),
            opportunity_description,
            champion: self.champion.clone(),
            watermarks: self.store.read::<Watermarks>(),
            champion_source,
            opportunities,
            history: log.recent(self.config.exploration.lookback).to_vec(),
        };
        let prompt = PromptBuilder::new(self.config.generator.prompt_budget_bytes).build(&inputs)?;
        write_atomic(&self.dir.join(PROMPT_FILE), &prompt)?;
        Ok(prompt)
    }

    /// Turn the artifact into the primary candidate and its family variants.
    fn extract(&self, artifact: &Artifact) -> Result<(Candidate, Vec<Variant>), StageError> {
        let candidate = |name: &str, content: &str| -> Result<Candidate, StageError> {
            if content.trim().is_empty() {
                return Err(StageError::new(
                    ErrorStage::ExtractFailed,
                    format!("candidate {name:?} has empty source"),
                ));
            }
            Ok(Candidate {
                content: content.to_string(),
                content_hash: content_hash(content),
                produced_by_iteration: self.id,
                name: name.to_string(),
                hypothesis_tags: artifact.hypothesis_tags.clone(),
                expected_range: artifact.expected_range,
                subfamily: artifact.subfamily.clone(),
            })
        };

        let members: Vec<Candidate> = if artifact.variants.is_empty() {
            vec![candidate(&artifact.name, &artifact.source)?]
        } else {
            artifact
                .variants
                .iter()
                .map(|variant| candidate(&variant.name, &variant.source))
                .collect::<Result<_, _>>()?
        };

        let mut variants = Vec::with_capacity(members.len());
        for (index, member) in members.iter().enumerate() {
            let candidate_path = self
                .store
                .write_candidate(&member.content_hash, &member.content)
                .stage(ErrorStage::ExtractFailed)?;
            variants.push(Variant {
                index,
                name: member.name.clone(),
                content_hash: member.content_hash.clone(),
                candidate_path,
            });
        }
        info!(
            name = %artifact.name,
            variants = variants.len(),
            hash = short_hash(&members[0].content_hash),
            "candidate extracted"
        );
        let primary = members.into_iter().next().ok_or_else(|| {
            StageError::new(ErrorStage::ExtractFailed, "artifact produced no candidate")
        })?;
        Ok((primary, variants))
    }

    async fn evaluate_single(&self, progress: &mut Progress) -> Result<(), StageError> {
        let Some(candidate) = progress.candidate.as_ref() else {
            return Err(StageError::new(ErrorStage::ExtractFailed, "no candidate"));
        };
        let path = self.store.candidate_path(&candidate.content_hash);
        let result = self
            .evaluate_one(&candidate.name, &path, EvalTier::Screening)
            .await?;
        progress.gates.batch.count = 1;
        progress.gates.batch.best_score = Some(result.effective_score);
        let result = self.confirm(&candidate.name, &path, result).await?;
        progress.result = Some(result);
        Ok(())
    }

    async fn evaluate_family(
        &self,
        variants: Vec<Variant>,
        progress: &mut Progress,
    ) -> Result<(), StageError> {
        let settings = BatchSettings {
            workers: self.config.evaluator.workers,
            early_n: self.config.gates.early_n,
            early_delta: self.config.gates.early_delta,
            batch_delta: self.config.gates.batch_delta,
            tier: EvalTier::Screening,
            screening_haircut: self.config.evaluator.screening_haircut,
            cancel_grace: Duration::from_secs(self.config.evaluator.grace_secs),
        };
        let report = run_batch(
            Arc::clone(&self.collaborators.evaluator),
            variants.clone(),
            self.champion.effective_score,
            &settings,
        )
        .await;
        progress.gates.batch = report.summary.gate_record();
        if report.summary.early_abort {
            progress.gates.early_abort = report.summary.early_abort_record();
        }

        let best = report.best_row().and_then(|row| {
            let variant = variants.iter().find(|variant| variant.index == row.index)?;
            Some((variant.clone(), row.result.clone()?))
        });
        let early_abort_reason = report.summary.early_abort_reason.clone();
        let all_failed = report.summary.completed_count > 0
            && report.summary.failed_count == report.summary.completed_count;
        progress.batch = Some(report);

        if let Some((variant, result)) = &best {
            if let Some(candidate) = progress.candidate.as_mut()
                && candidate.content_hash != variant.content_hash
            {
                let content = fs::read_to_string(&variant.candidate_path)
                    .with_context(|| format!("read {}", variant.candidate_path.display()))
                    .stage(ErrorStage::ExtractFailed)?;
                candidate.content = content;
                candidate.content_hash = variant.content_hash.clone();
                candidate.name = variant.name.clone();
            }
            progress.result = Some(result.clone());
        }

        if let Some(reason) = early_abort_reason {
            return Err(StageError::new(ErrorStage::GateAbort, reason));
        }
        let Some((variant, result)) = best else {
            let message = if all_failed {
                "every variant evaluation failed"
            } else {
                "no variant produced a score"
            };
            return Err(StageError::new(ErrorStage::TestFailed, message));
        };
        let batch_failed = progress.gates.batch.failed;
        if !batch_failed {
            let confirmed = self
                .confirm(&variant.name, &variant.candidate_path, result)
                .await?;
            progress.result = Some(confirmed);
        }
        Ok(())
    }

    async fn evaluate_one(
        &self,
        label: &str,
        path: &Path,
        tier: EvalTier,
    ) -> Result<EvaluationResult, StageError> {
        let request = EvalRequest {
            label: label.to_string(),
            candidate_path: path.to_path_buf(),
            tier,
        };
        let (_cancel_tx, cancel) = watch::channel(false);
        let report = self
            .collaborators
            .evaluator
            .evaluate(&request, cancel)
            .await
            .stage(ErrorStage::TestFailed)?;
        Ok(EvaluationResult::derive(
            report.screening_score,
            report.authoritative_score,
            report.robustness_adjustment,
            self.config.evaluator.screening_haircut,
            report.observed_subfamily,
        ))
    }

    /// Re-evaluate at the authoritative tier when a screening-only result would
    /// otherwise be barred from confirming.
    async fn confirm(
        &self,
        label: &str,
        path: &Path,
        result: EvaluationResult,
    ) -> Result<EvaluationResult, StageError> {
        let needs_confirmation = self.config.gates.confirmations > 1
            && !result.is_authoritative()
            && beats(result.effective_score, &self.champion);
        if !needs_confirmation {
            return Ok(result);
        }
        info!(screening = result.effective_score, "confirming at authoritative tier");
        let confirmed = self.evaluate_one(label, path, EvalTier::Authoritative).await?;
        Ok(EvaluationResult {
            observed_subfamily: confirmed
                .observed_subfamily
                .clone()
                .or(result.observed_subfamily),
            ..confirmed
        })
    }

    fn finish(
        &self,
        mut progress: Progress,
        halted: Option<StageError>,
        started: Instant,
        started_at: String,
    ) -> Result<StepOutcome> {
        let status = halted
            .as_ref()
            .map_or(IterationStatus::Completed, |err| err.stage.status());
        let error = halted.map(|err| {
            warn!(stage = err.stage.as_str(), message = %err.message, "iteration stopped");
            IterationError {
                stage: err.stage,
                message: err.message,
            }
        });

        let mut champion_after = self.champion.clone();
        let mut promoted = false;
        if status == IterationStatus::Completed
            && let (Some(candidate), Some(result)) = (&progress.candidate, &progress.result)
        {
            let request = PromotionRequest {
                iteration: self.id,
                content_hash: candidate.content_hash.clone(),
                effective_score: result.effective_score,
                raw_score: result.raw_score,
                authoritative: result.is_authoritative(),
                batch_failed: progress.gates.batch.failed,
            };
            let outcome = PromotionController::new(&self.store, self.config.gates.confirmations)
                .maybe_promote(&request)?;
            progress.gates.promotion_gate =
                outcome.decision.gate_record(self.config.gates.confirmations);
            promoted = outcome.decision.is_promoted();
            champion_after = outcome.champion_after;
        }

        if let Some(plan) = &progress.plan {
            // Without a champion there is no baseline, so no delta. Conformance
            // only trusts what the evaluator observed, never the artifact's claim.
            let sample = OutcomeSample {
                delta: progress
                    .result
                    .as_ref()
                    .zip(self.champion.effective_score)
                    .map(|(result, champion)| result.effective_score - champion),
                observed_subfamily: progress
                    .result
                    .as_ref()
                    .and_then(|result| result.observed_subfamily.clone()),
            };
            let mut book = self.store.read::<OpportunityBook>();
            self.scorer().record(&mut book, self.id, status, plan, &sample);
            self.store.write(&book)?;
        }

        let mut audit = self.store.read::<GateAudit>();
        if audit.insert_once(self.id, progress.gates.clone()) {
            self.store.write(&audit)?;
        }

        let result_path = self.dir.join(RESULT_FILE);
        let doc = IterationResultDoc {
            iteration: self.id,
            status,
            plan: progress.plan.as_ref(),
            candidate: progress.candidate.as_ref().map(|candidate| CandidateSummary {
                name: &candidate.name,
                content_hash: &candidate.content_hash,
                hypothesis_tags: &candidate.hypothesis_tags,
                expected_range: candidate.expected_range,
                subfamily: candidate.subfamily.as_deref(),
                path: self.store.candidate_path(&candidate.content_hash),
            }),
            recovered_from_checkpoint: progress.recovered_from_checkpoint,
            evaluation: progress.result.as_ref(),
            batch: progress.batch.as_ref(),
            champion_before: self.champion.effective_score,
            champion_after: champion_after.effective_score,
            promoted,
            gates: &progress.gates,
            error: error.as_ref(),
        };
        write_atomic(&result_path, &to_json_pretty(&doc)?)?;

        let result_ref = result_path
            .strip_prefix(&self.paths.dir)
            .unwrap_or(&result_path)
            .to_string_lossy()
            .into_owned();
        let record = IterationRecord {
            id: self.id,
            status,
            started_at,
            finished_at: Some(Utc::now().to_rfc3339()),
            duration_ms: Some(started.elapsed().as_millis() as u64),
            opportunity_id: progress
                .plan
                .as_ref()
                .and_then(|plan| plan.opportunity_id.clone()),
            candidate_ref: progress
                .candidate
                .as_ref()
                .map(|candidate| candidate.content_hash.clone()),
            result_ref: Some(result_ref),
            effective_score: progress.result.as_ref().map(|result| result.effective_score),
            promoted,
            error,
        };
        let mut log = self.store.read::<IterationLog>();
        if log.append(record.clone()) {
            self.store.write(&log)?;
        }
        info!(
            status = ?record.status,
            score = ?record.effective_score,
            promoted,
            "iteration recorded"
        );

        Ok(StepOutcome {
            record,
            gates: progress.gates,
            plan: progress.plan,
            champion_score: champion_after.effective_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::opportunity::OpportunitySpec;
    use crate::test_support::{
        ScriptedEval, ScriptedEvaluator, ScriptedGeneration, ScriptedGenerator, TestState,
    };

    async fn run_one(
        state: &TestState,
        config: &LoopConfig,
        generator: &ScriptedGenerator,
        evaluator: ScriptedEvaluator,
        id: IterationId,
    ) -> (StepOutcome, Arc<ScriptedEvaluator>) {
        state
            .store
            .write(&IterationCounter(id))
            .expect("claim id");
        let evaluator = Arc::new(evaluator);
        let collaborators = Collaborators {
            generator,
            evaluator: evaluator.clone(),
        };
        let outcome = run_iteration(&state.paths, config, &collaborators, id)
            .await
            .expect("iteration");
        (outcome, evaluator)
    }

    #[tokio::test]
    async fn single_candidate_is_confirmed_and_promoted_after_k() {
        let state = TestState::new(Some(480.0)).expect("state");
        let config = state.config();
        let generator = ScriptedGenerator::new([
            ScriptedGeneration::candidate("curve", "fn fee() -> u32 { 30 }"),
            ScriptedGeneration::candidate("curve", "fn fee() -> u32 { 30 }"),
        ]);
        let script = || ScriptedEvaluator::new([("curve", ScriptedEval::score(484.0).confirmed_at(485.0))]);

        let (first, evaluator) = run_one(&state, &config, &generator, script(), 1).await;
        assert_eq!(first.record.status, IterationStatus::Completed);
        assert!(!first.record.promoted);
        assert_eq!(first.record.effective_score, Some(485.0));
        assert_eq!(
            first.gates.promotion_gate.reason.as_deref(),
            Some("pending: 1/2")
        );
        assert_eq!(
            evaluator.calls(),
            vec![
                ("curve".to_string(), EvalTier::Screening),
                ("curve".to_string(), EvalTier::Authoritative)
            ]
        );

        let (second, _) = run_one(&state, &config, &generator, script(), 2).await;
        assert!(second.record.promoted);
        assert_eq!(second.champion_score, Some(485.0));
        assert_eq!(state.store.read::<ChampionScore>().0, Some(485.0));

        let log = state.store.read::<IterationLog>();
        assert_eq!(log.records.len(), 2);
        let audit = state.store.read::<GateAudit>();
        assert_eq!(audit.records.len(), 2);
        assert!(state.paths.iteration_dir(2).join(RESULT_FILE).exists());
        assert!(state.paths.iteration_dir(2).join(PROMPT_FILE).exists());
    }

    #[tokio::test]
    async fn low_score_is_completed_without_confirmation() {
        let state = TestState::new(Some(480.0)).expect("state");
        let config = state.config();
        let generator = ScriptedGenerator::new([ScriptedGeneration::candidate("flat", "fn f() {}")]);
        let (outcome, evaluator) = run_one(
            &state,
            &config,
            &generator,
            ScriptedEvaluator::uniform(ScriptedEval::score(470.0)),
            1,
        )
        .await;
        assert_eq!(outcome.record.status, IterationStatus::Completed);
        assert_eq!(evaluator.calls().len(), 1);
        assert_eq!(outcome.record.effective_score, Some(470.0));
        assert!(!outcome.gates.promotion_gate.blocked);
    }

    #[tokio::test]
    async fn evaluator_crash_is_test_failed() {
        let state = TestState::new(Some(480.0)).expect("state");
        let config = state.config();
        let generator = ScriptedGenerator::new([ScriptedGeneration::candidate("x", "fn x() {}")]);
        let (outcome, _) = run_one(
            &state,
            &config,
            &generator,
            ScriptedEvaluator::uniform(ScriptedEval::failure("compile error")),
            1,
        )
        .await;
        assert_eq!(outcome.record.status, IterationStatus::Failed);
        let error = outcome.record.error.expect("error");
        assert_eq!(error.stage, ErrorStage::TestFailed);
        assert!(error.message.contains("compile error"));
    }

    #[tokio::test]
    async fn generator_crash_is_generation_failed() {
        let state = TestState::new(None).expect("state");
        let config = state.config();
        let generator = ScriptedGenerator::new([ScriptedGeneration::crashing("boom")]);
        let (outcome, evaluator) = run_one(
            &state,
            &config,
            &generator,
            ScriptedEvaluator::uniform(ScriptedEval::score(1.0)),
            1,
        )
        .await;
        assert_eq!(
            outcome.record.error.map(|error| error.stage),
            Some(ErrorStage::GenerationFailed)
        );
        assert!(evaluator.calls().is_empty());
    }

    /// Verifies inconsistent canonical state skips the iteration before the prompt is built.
    #[tokio::test]
    async fn guardrail_violation_skips_before_prompt() {
        let state = TestState::new(Some(480.0)).expect("state");
        state
            .store
            .write(&ChampionScore(Some(999.0)))
            .expect("corrupt scalar");
        let config = state.config();
        let generator = ScriptedGenerator::new([ScriptedGeneration::candidate("x", "y")]);
        let (outcome, _) = run_one(
            &state,
            &config,
            &generator,
            ScriptedEvaluator::uniform(ScriptedEval::score(1.0)),
            1,
        )
        .await;
        assert_eq!(outcome.record.status, IterationStatus::Skipped);
        assert_eq!(
            outcome.record.error.map(|error| error.stage),
            Some(ErrorStage::KnowledgeGuardrailFailed)
        );
        assert_eq!(generator.remaining(), 1);
        assert!(!state.paths.iteration_dir(1).join(PROMPT_FILE).exists());
    }

    #[tokio::test]
    async fn family_early_abort_is_gate_abort() {
        let state = TestState::new(Some(500.0)).expect("state");
        let config = state.config();
        let generator = ScriptedGenerator::new([ScriptedGeneration::family(
            "fam",
            &[
                ("a", "fn a() {}"),
                ("b", "fn b() {}"),
                ("c", "fn c() {}"),
                ("d", "fn d() {}"),
                ("e", "fn e() {}"),
                ("f", "fn f() {}"),
            ],
        )]);
        let evaluator = ScriptedEvaluator::new([
            ("a", ScriptedEval::score(495.0)),
            ("b", ScriptedEval::score(493.0)),
            ("c", ScriptedEval::score(497.0)),
            ("d", ScriptedEval::score(496.0)),
        ])
        .with_fallback(ScriptedEval::score(600.0));
        let (outcome, evaluator) = run_one(&state, &config, &generator, evaluator, 1).await;

        assert_eq!(outcome.record.status, IterationStatus::Aborted);
        assert_eq!(
            outcome.record.error.as_ref().map(|error| error.stage),
            Some(ErrorStage::GateAbort)
        );
        assert!(outcome.gates.early_abort.triggered);
        assert_eq!(outcome.gates.batch.count, 6);
        assert_eq!(outcome.gates.batch.best_score, Some(497.0));
        assert_eq!(outcome.record.effective_score, Some(497.0));
        assert!(!evaluator.was_called("e"));
        assert_eq!(state.store.read::<Champion>().effective_score, Some(500.0));
    }

    #[tokio::test]
    async fn family_best_variant_is_confirmed() {
        let state = TestState::new(Some(500.0)).expect("state");
        let mut config = state.config();
        config.gates.confirmations = 1;
        let generator = ScriptedGenerator::new([ScriptedGeneration::family(
            "fam",
            &[("a", "fn a() {}"), ("b", "fn b() {}"), ("c", "fn c() {}")],
        )]);
        let evaluator = ScriptedEvaluator::new([
            ("a", ScriptedEval::score(499.0)),
            ("b", ScriptedEval::score(503.0)),
            ("c", ScriptedEval::score(501.0)),
        ]);
        let (outcome, _) = run_one(&state, &config, &generator, evaluator, 1).await;

        assert!(outcome.record.promoted);
        assert_eq!(outcome.champion_score, Some(503.0));
        assert_eq!(
            outcome.record.candidate_ref,
            Some(content_hash("fn b() {}"))
        );
        let champion = state.store.read::<Champion>();
        assert_eq!(champion.candidate_ref, Some(content_hash("fn b() {}")));
    }

    #[tokio::test]
    async fn bound_plan_records_opportunity_outcome() {
        let state = TestState::new(Some(480.0)).expect("state");
        let mut config = state.config();
        config.opportunities = vec![OpportunitySpec {
            family_class: "fee_curve".to_string(),
            subfamily: "convex".to_string(),
            expected_uplift: 2.0,
            confidence: 0.5,
            description: "steeper".to_string(),
        }];
        let generator = ScriptedGenerator::new([ScriptedGeneration::candidate("c", "fn c() {}")]);
        let (outcome, _) = run_one(
            &state,
            &config,
            &generator,
            ScriptedEvaluator::uniform(ScriptedEval::score(470.0).observing("convex")),
            1,
        )
        .await;

        assert_eq!(outcome.record.opportunity_id.as_deref(), Some("fee_curve/convex"));
        let book = state.store.read::<OpportunityBook>();
        let record = &book.records["fee_curve/convex"];
        assert_eq!(record.ewma_count, 1);
        assert!((record.ewma_delta - 0.3 * -10.0).abs() < 1e-9);
        let requests = generator.requests();
        assert!(requests[0].prompt.contains("fee_curve/convex"));
    }

    fn convex_opportunity() -> OpportunitySpec {
        OpportunitySpec {
            family_class: "fee_curve".to_string(),
            subfamily: "convex".to_string(),
            expected_uplift: 2.0,
            confidence: 0.5,
            description: "steeper".to_string(),
        }
    }

    /// Verifies the artifact's own subfamily claim never counts toward conformance.
    #[tokio::test]
    async fn conformance_ignores_unobserved_subfamily_claims() {
        let state = TestState::new(Some(480.0)).expect("state");
        let mut config = state.config();
        config.opportunities = vec![convex_opportunity()];
        let generator = ScriptedGenerator::new([ScriptedGeneration::with_artifact(
            serde_json::json!({"name": "c", "source": "fn c() {}", "subfamily": "convex"}),
        )]);
        let (outcome, _) = run_one(
            &state,
            &config,
            &generator,
            ScriptedEvaluator::uniform(ScriptedEval::score(470.0)),
            1,
        )
        .await;

        assert_eq!(outcome.record.opportunity_id.as_deref(), Some("fee_curve/convex"));
        let book = state.store.read::<OpportunityBook>();
        let stats = &book.records["fee_curve/convex"].conformance_stats;
        assert_eq!(stats.required, 0);
        assert_eq!(stats.matched, 0);
    }

    #[tokio::test]
    async fn outcome_without_champion_records_no_delta() {
        let state = TestState::new(None).expect("state");
        let mut config = state.config();
        config.opportunities = vec![convex_opportunity()];
        let generator = ScriptedGenerator::new([ScriptedGeneration::candidate("c", "fn c() {}")]);
        let (outcome, _) = run_one(
            &state,
            &config,
            &generator,
            ScriptedEvaluator::uniform(ScriptedEval::score(470.0)),
            1,
        )
        .await;

        assert_eq!(outcome.record.effective_score, Some(470.0));
        let book = state.store.read::<OpportunityBook>();
        let record = &book.records["fee_curve/convex"];
        assert_eq!(record.ewma_count, 0);
        assert_eq!(record.ewma_delta, 0.0);
        assert_eq!(book.outcome_window.len(), 1);
        assert_eq!(book.outcome_window[0].delta, None);
        assert!(!book.outcome_window[0].uplift);
    }
}
