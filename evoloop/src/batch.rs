//! Bounded-concurrency batch evaluation with family-level gates.
//!
//! Up to `workers` evaluations run at once, each holding an owned semaphore
//! permit that is released on every exit path. Variants beyond the first
//! `max(early_n, workers)` wait at a barrier until the first `early_n`
//! completions have been judged by the early-abort gate. On abort, held
//! variants report `not_attempted` and running ones are cancelled and report
//! `aborted`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::core::gates::{EarlyAbortDecision, EarlyAbortGate, batch_fail_reason};
use crate::core::types::{BatchGateRecord, EarlyAbortRecord, EvaluationResult};
use crate::io::evaluator::{EvalRequest, EvalTier, EvaluationCancelled, Evaluator};

/// One member of a candidate family.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    /// Launch index (0-based).
    pub index: usize,
    pub name: String,
    pub content_hash: String,
    pub candidate_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantStatus {
    /// The evaluator returned a report.
    Completed,
    /// The evaluator crashed or its output was unusable.
    Failed,
    /// Cancelled while running.
    Aborted,
    /// Never started because of an early abort.
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantRow {
    pub index: usize,
    pub name: String,
    pub content_hash: String,
    pub status: VariantStatus,
    pub result: Option<EvaluationResult>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl VariantRow {
    pub fn score(&self) -> Option<f64> {
        self.result.as_ref().map(|result| result.effective_score)
    }
}

/// Family-level summary. `completed_count` includes failed evaluations
/// (they ran to an end); `failed_count` is the subset that produced no score.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub best_score: Option<f64>,
    pub best_index: Option<usize>,
    pub completed_count: usize,
    pub failed_count: usize,
    pub aborted_count: usize,
    pub not_attempted_count: usize,
    pub early_abort: bool,
    pub early_abort_reason: Option<String>,
    pub batch_failed: bool,
    pub fail_reason: Option<String>,
}

impl BatchSummary {
    pub fn early_abort_record(&self) -> EarlyAbortRecord {
        EarlyAbortRecord {
            triggered: self.early_abort,
            reason: self.early_abort_reason.clone(),
        }
    }

    pub fn gate_record(&self) -> BatchGateRecord {
        BatchGateRecord {
            count: self.total,
            best_score: self.best_score,
            failed: self.batch_failed,
            fail_reason: self.fail_reason.clone(),
        }
    }
}

/// Batch output: rows in completion order plus the summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub rows: Vec<VariantRow>,
    pub summary: BatchSummary,
}

impl BatchReport {
    /// Rows reordered by launch index, for display.
    pub fn in_launch_order(&self) -> Vec<&VariantRow> {
        let mut rows: Vec<&VariantRow> = self.rows.iter().collect();
        rows.sort_by_key(|row| row.index);
        rows
    }

    pub fn best_row(&self) -> Option<&VariantRow> {
        let best = self.summary.best_index?;
        self.rows.iter().find(|row| row.index == best)
    }
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub workers: usize,
    pub early_n: usize,
    pub early_delta: f64,
    pub batch_delta: f64,
    pub tier: EvalTier,
    pub screening_haircut: f64,
    /// How long cancelled workers get to wind down before their tasks are aborted.
    pub cancel_grace: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Barrier {
    Waiting,
    Open,
    Abort,
}

/// Sends exactly one row per variant, even if the worker panics or is aborted.
struct RowGuard {
    tx: mpsc::UnboundedSender<VariantRow>,
    index: usize,
    name: String,
    content_hash: String,
    started: Instant,
    sent: bool,
}

impl RowGuard {
    fn new(tx: mpsc::UnboundedSender<VariantRow>, variant: &Variant) -> Self {
        Self {
            tx,
            index: variant.index,
            name: variant.name.clone(),
            content_hash: variant.content_hash.clone(),
            started: Instant::now(),
            sent: false,
        }
    }

    fn restart_clock(&mut self) {
        self.started = Instant::now();
    }

    fn send(&mut self, status: VariantStatus, result: Option<EvaluationResult>, error: Option<String>) {
        if self.sent {
            return;
        }
        self.sent = true;
        let duration_ms = match status {
            VariantStatus::NotAttempted => 0,
            _ => self.started.elapsed().as_millis() as u64,
        };
        let row = VariantRow {
            index: self.index,
            name: std::mem::take(&mut self.name),
            content_hash: std::mem::take(&mut self.content_hash),
            status,
            result,
            duration_ms,
            error,
        };
        if self.tx.send(row).is_err() {
            debug!(index = self.index, "batch collector gone, dropping row");
        }
    }
}

impl Drop for RowGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.send(
                VariantStatus::Failed,
                None,
                Some("evaluation worker panicked".to_string()),
            );
        } else {
            self.send(
                VariantStatus::Aborted,
                None,
                Some("evaluation task aborted".to_string()),
            );
        }
    }
}

async fn wait_at_barrier(barrier: &mut watch::Receiver<Barrier>) -> Barrier {
    loop {
        let state = *barrier.borrow_and_update();
        if state != Barrier::Waiting {
            return state;
        }
        if barrier.changed().await.is_err() {
            return Barrier::Abort;
        }
    }
}

/// Evaluate `variants` under the worker budget and family gates.
///
/// `champion` is the current champion's effective score; without one the
/// early-abort gate is inactive and the batch only fails when nothing scored.
pub async fn run_batch<E>(
    evaluator: Arc<E>,
    variants: Vec<Variant>,
    champion: Option<f64>,
    settings: &BatchSettings,
) -> BatchReport
where
    E: Evaluator + ?Sized + 'static,
{
    let total = variants.len();
    let early_n = settings.early_n;
    let gate_active = champion.is_some() && early_n > 0 && total > early_n;
    info!(total, workers = settings.workers, gate_active, "batch evaluation starting");

    let semaphore = Arc::new(Semaphore::new(settings.workers.max(1)));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (barrier_tx, barrier_rx) = watch::channel(if gate_active {
        Barrier::Waiting
    } else {
        Barrier::Open
    });
    let (row_tx, mut row_rx) = mpsc::unbounded_channel();
    let mut workers = JoinSet::new();
    let free_launches = early_n.max(settings.workers);

    for variant in variants {
        let evaluator = Arc::clone(&evaluator);
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel_rx.clone();
        let mut barrier = barrier_rx.clone();
        let mut guard = RowGuard::new(row_tx.clone(), &variant);
        let held = gate_active && variant.index >= free_launches;
        let tier = settings.tier;
        let haircut = settings.screening_haircut;

        workers.spawn(async move {
            if held && wait_at_barrier(&mut barrier).await == Barrier::Abort {
                guard.send(VariantStatus::NotAttempted, None, None);
                return;
            }
            let Ok(_permit) = semaphore.acquire_owned().await else {
                guard.send(VariantStatus::NotAttempted, None, None);
                return;
            };
            if *cancel.borrow() {
                guard.send(VariantStatus::NotAttempted, None, None);
                return;
            }
            guard.restart_clock();
            let request = EvalRequest {
                label: variant.name.clone(),
                candidate_path: variant.candidate_path.clone(),
                tier,
            };
            match evaluator.evaluate(&request, cancel).await {
                Ok(report) => {
                    let result = EvaluationResult::derive(
                        report.screening_score,
                        report.authoritative_score,
                        report.robustness_adjustment,
                        haircut,
                        report.observed_subfamily,
                    );
                    guard.send(VariantStatus::Completed, Some(result), None);
                }
                Err(err) if err.downcast_ref::<EvaluationCancelled>().is_some() => {
                    guard.send(VariantStatus::Aborted, None, None);
                }
                Err(err) => {
                    warn!(variant = %variant.name, err = %format!("{err:#}"), "variant evaluation failed");
                    guard.send(VariantStatus::Failed, None, Some(format!("{err:#}")));
                }
            }
        });
    }
    drop(row_tx);

    let mut gate = EarlyAbortGate::new(champion, early_n, settings.early_delta);
    let mut early_abort_reason = None;
    let mut abort_deadline: Option<tokio::time::Instant> = None;
    let mut rows = Vec::with_capacity(total);

    loop {
        let next = match abort_deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, row_rx.recv()).await {
                Ok(row) => row,
                Err(_) => {
                    warn!("cancelled workers exceeded grace, aborting tasks");
                    workers.abort_all();
                    abort_deadline = None;
                    continue;
                }
            },
            None => row_rx.recv().await,
        };
        let Some(row) = next else {
            break;
        };
        debug!(index = row.index, status = ?row.status, score = ?row.score(), "variant finished");

        let judged = matches!(row.status, VariantStatus::Completed | VariantStatus::Failed);
        if gate_active && judged && !gate.is_decided() {
            match gate.observe(row.score()) {
                EarlyAbortDecision::Abort { reason } => {
                    info!(%reason, "batch early abort");
                    early_abort_reason = Some(reason);
                    cancel_tx.send_replace(true);
                    barrier_tx.send_replace(Barrier::Abort);
                    abort_deadline = Some(tokio::time::Instant::now() + settings.cancel_grace);
                }
                EarlyAbortDecision::Proceed => {
                    barrier_tx.send_replace(Barrier::Open);
                }
                EarlyAbortDecision::Pending { .. } => {}
            }
        }
        rows.push(row);
    }
    while workers.join_next().await.is_some() {}

    let summary = summarize(&rows, total, champion, settings.batch_delta, early_abort_reason);
    info!(
        best = ?summary.best_score,
        completed = summary.completed_count,
        aborted = summary.aborted_count,
        not_attempted = summary.not_attempted_count,
        early_abort = summary.early_abort,
        batch_failed = summary.batch_failed,
        "batch evaluation finished"
    );
    BatchReport { rows, summary }
}

fn summarize(
    rows: &[VariantRow],
    total: usize,
    champion: Option<f64>,
    batch_delta: f64,
    early_abort_reason: Option<String>,
) -> BatchSummary {
    let mut summary = BatchSummary {
        total,
        early_abort: early_abort_reason.is_some(),
        early_abort_reason,
        ..BatchSummary::default()
    };
    for row in rows {
        match row.status {
            VariantStatus::Completed => summary.completed_count += 1,
            VariantStatus::Failed => {
                summary.completed_count += 1;
                summary.failed_count += 1;
            }
            VariantStatus::Aborted => summary.aborted_count += 1,
            VariantStatus::NotAttempted => summary.not_attempted_count += 1,
        }
        if row.status != VariantStatus::Completed {
            continue;
        }
        if let Some(score) = row.score()
            && summary.best_score.is_none_or(|best| score > best)
        {
            summary.best_score = Some(score);
            summary.best_index = Some(row.index);
        }
    }
    if !summary.early_abort
        && let Some(reason) = batch_fail_reason(summary.best_score, champion, batch_delta)
    {
        summary.batch_failed = true;
        summary.fail_reason = Some(reason);
    }
    summary
}
