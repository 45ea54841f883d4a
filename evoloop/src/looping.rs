//! Multi-iteration driver for `evoloop run`.
//!
//! Strictly sequential: iteration N+1 starts only after N has been logged.
//! Each iteration id is claimed in `iteration_counter` before any work, so a
//! crash leaves a claimed-but-unlogged id that the next start records as
//! `interrupted`.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::core::types::{
    Champion, ErrorStage, IterationError, IterationId, IterationRecord, IterationStatus,
};
use crate::io::config::LoopConfig;
use crate::io::documents::{IterationCounter, IterationLog, StartTimestamp};
use crate::io::init::StatePaths;
use crate::io::rate_limiter::RateLimiter;
use crate::io::store::StateStore;
use crate::step::{Collaborators, StepOutcome, run_iteration};

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopStop {
    /// The iteration counter reached `max_iterations`.
    MaxIterations { max_iterations: u64 },
    /// Wall-clock time since `start_timestamp` exceeded the budget.
    MaxRuntime { elapsed_secs: u64, max_runtime_secs: u64 },
    /// The champion reached the target score.
    TargetReached { champion: f64, target: f64 },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    /// First iteration id this invocation would run.
    pub started_at_iteration: IterationId,
    pub iterations_run: u64,
    /// Claimed ids found unlogged at startup.
    pub interrupted: Vec<IterationId>,
    pub stop: LoopStop,
}

/// Record every claimed-but-unlogged iteration as interrupted.
pub fn reconcile_interrupted(store: &StateStore) -> Result<Vec<IterationId>> {
    let counter = store.read::<IterationCounter>().0;
    let mut log = store.read::<IterationLog>();
    let first_unlogged = log.last_id().map_or(1, |last| last + 1);
    let now = Utc::now().to_rfc3339();
    let mut reconciled = Vec::new();
    for id in first_unlogged..=counter {
        let appended = log.append(IterationRecord {
            id,
            status: IterationStatus::Interrupted,
            started_at: now.clone(),
            finished_at: None,
            duration_ms: None,
            opportunity_id: None,
            candidate_ref: None,
            result_ref: None,
            effective_score: None,
            promoted: false,
            error: Some(IterationError {
                stage: ErrorStage::Interrupted,
                message: "process exited before the iteration was recorded".to_string(),
            }),
        });
        if appended {
            reconciled.push(id);
        }
    }
    if !reconciled.is_empty() {
        warn!(?reconciled, "recording interrupted iterations");
        store.write(&log)?;
    }
    Ok(reconciled)
}

fn stop_condition(store: &StateStore, config: &LoopConfig, started: DateTime<Utc>) -> Option<LoopStop> {
    let limits = &config.limits;
    if let Some(target) = limits.target_score
        && let Some(champion) = store.read::<Champion>().effective_score
        && champion >= target
    {
        return Some(LoopStop::TargetReached { champion, target });
    }
    if let Some(max_iterations) = limits.max_iterations
        && store.read::<IterationCounter>().0 >= max_iterations
    {
        return Some(LoopStop::MaxIterations { max_iterations });
    }
    if let Some(max_runtime_secs) = limits.max_runtime_secs {
        let elapsed_secs = u64::try_from((Utc::now() - started).num_seconds()).unwrap_or(0);
        if elapsed_secs >= max_runtime_secs {
            return Some(LoopStop::MaxRuntime {
                elapsed_secs,
                max_runtime_secs,
            });
        }
    }
    None
}

fn load_or_set_start(store: &StateStore) -> Result<DateTime<Utc>> {
    if let Some(ts) = store.read::<StartTimestamp>().0
        && let Ok(parsed) = DateTime::parse_from_rfc3339(&ts)
    {
        return Ok(parsed.with_timezone(&Utc));
    }
    let now = Utc::now();
    store.write(&StartTimestamp(Some(now.to_rfc3339())))?;
    Ok(now)
}

/// Run iterations until a configured stop condition holds.
///
/// Per-iteration faults are recorded in the log and never stop the loop;
/// only state-store I/O failures are returned as errors.
#[instrument(skip_all, fields(state_dir = %paths.dir.display()))]
pub async fn run_loop<F: FnMut(&StepOutcome)>(
    paths: &StatePaths,
    config: &LoopConfig,
    collaborators: &Collaborators<'_>,
    mut on_step: F,
) -> Result<LoopOutcome> {
    let store = StateStore::new(&paths.dir);
    let interrupted = reconcile_interrupted(&store)?;
    let started = load_or_set_start(&store)?;
    let limiter = RateLimiter::new(&store, Duration::from_secs(config.min_delay_secs));
    let started_at_iteration = store.read::<IterationCounter>().0 + 1;

    let mut iterations_run = 0u64;
    loop {
        if let Some(stop) = stop_condition(&store, config, started) {
            info!(?stop, iterations_run, "loop stopping");
            return Ok(LoopOutcome {
                started_at_iteration,
                iterations_run,
                interrupted,
                stop,
            });
        }

        limiter.wait_turn().await?;
        let id = store.read::<IterationCounter>().0 + 1;
        store.write(&IterationCounter(id))?;
        let step = run_iteration(paths, config, collaborators, id).await?;
        iterations_run += 1;
        on_step(&step);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::io::documents::ChampionScore;
    use crate::test_support::{
        ScriptedEval, ScriptedEvaluator, ScriptedGeneration, ScriptedGenerator, TestState,
    };

    fn generator(n: usize) -> ScriptedGenerator {
        ScriptedGenerator::new(
            (0..n).map(|i| ScriptedGeneration::candidate(&format!("c{i}"), &format!("fn c{i}() {{}}"))),
        )
    }

    #[tokio::test]
    async fn loop_stops_at_max_iterations() {
        let state = TestState::new(Some(480.0)).expect("state");
        let mut config = state.config();
        config.limits.max_iterations = Some(3);
        let generator = generator(5);
        let collaborators = Collaborators {
            generator: &generator,
            evaluator: Arc::new(ScriptedEvaluator::uniform(ScriptedEval::score(470.0))),
        };
        let mut seen = Vec::new();
        let outcome = run_loop(&state.paths, &config, &collaborators, |step| {
            seen.push(step.record.id);
        })
        .await
        .expect("loop");

        assert_eq!(outcome.iterations_run, 3);
        assert_eq!(outcome.stop, LoopStop::MaxIterations { max_iterations: 3 });
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(state.store.read::<IterationCounter>().0, 3);
        assert_eq!(state.store.read::<IterationLog>().records.len(), 3);

        let again = run_loop(&state.paths, &config, &collaborators, |_| {})
            .await
            .expect("loop");
        assert_eq!(again.iterations_run, 0);
    }

    #[tokio::test]
    async fn loop_stops_once_target_is_reached() {
        let state = TestState::new(Some(480.0)).expect("state");
        let mut config = state.config();
        config.gates.confirmations = 1;
        config.limits.target_score = Some(490.0);
        config.limits.max_iterations = Some(10);
        let generator = generator(10);
        let collaborators = Collaborators {
            generator: &generator,
            evaluator: Arc::new(
                ScriptedEvaluator::new([("c1", ScriptedEval::authoritative(495.0))])
                    .with_fallback(ScriptedEval::score(470.0)),
            ),
        };
        let outcome = run_loop(&state.paths, &config, &collaborators, |_| {})
            .await
            .expect("loop");

        assert_eq!(outcome.iterations_run, 2);
        assert_eq!(
            outcome.stop,
            LoopStop::TargetReached {
                champion: 495.0,
                target: 490.0
            }
        );
        assert_eq!(state.store.read::<ChampionScore>().0, Some(495.0));
    }

    #[tokio::test]
    async fn failing_iterations_never_stop_the_loop() {
        let state = TestState::new(Some(480.0)).expect("state");
        let mut config = state.config();
        config.limits.max_iterations = Some(2);
        let generator = ScriptedGenerator::new([
            ScriptedGeneration::crashing("first"),
            ScriptedGeneration::with_artifact(serde_json::json!({"name": "bad"})),
        ]);
        let collaborators = Collaborators {
            generator: &generator,
            evaluator: Arc::new(ScriptedEvaluator::uniform(ScriptedEval::score(1.0))),
        };
        let outcome = run_loop(&state.paths, &config, &collaborators, |_| {})
            .await
            .expect("loop");
        assert_eq!(outcome.iterations_run, 2);
        let stages: Vec<ErrorStage> = state
            .store
            .read::<IterationLog>()
            .records
            .iter()
            .filter_map(|record| record.error.as_ref().map(|error| error.stage))
            .collect();
        assert_eq!(stages, vec![ErrorStage::GenerationFailed, ErrorStage::ExtractFailed]);
    }

    /// Verifies a claimed id with no log entry is recorded as interrupted on restart.
    #[tokio::test]
    async fn claimed_unlogged_iteration_is_reconciled() {
        let state = TestState::new(Some(480.0)).expect("state");
        state.store.write(&IterationCounter(1)).expect("claim");
        let mut config = state.config();
        config.limits.max_iterations = Some(2);
        let generator = generator(1);
        let collaborators = Collaborators {
            generator: &generator,
            evaluator: Arc::new(ScriptedEvaluator::uniform(ScriptedEval::score(470.0))),
        };
        let outcome = run_loop(&state.paths, &config, &collaborators, |_| {})
            .await
            .expect("loop");

        assert_eq!(outcome.interrupted, vec![1]);
        assert_eq!(outcome.started_at_iteration, 2);
        let log = state.store.read::<IterationLog>();
        assert_eq!(log.records[0].status, IterationStatus::Interrupted);
        assert_eq!(log.records[1].id, 2);
        assert_eq!(log.records[1].status, IterationStatus::Completed);
    }

    #[tokio::test]
    async fn zero_runtime_budget_stops_immediately() {
        let state = TestState::new(None).expect("state");
        let mut config = state.config();
        config.limits.max_runtime_secs = Some(0);
        let generator = generator(0);
        let collaborators = Collaborators {
            generator: &generator,
            evaluator: Arc::new(ScriptedEvaluator::default()),
        };
        let outcome = run_loop(&state.paths, &config, &collaborators, |_| {})
            .await
            .expect("loop");
        assert_eq!(outcome.iterations_run, 0);
        assert!(matches!(outcome.stop, LoopStop::MaxRuntime { .. }));
        assert!(state.store.read::<StartTimestamp>().0.is_some());
    }
}
