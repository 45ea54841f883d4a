//! Execution gates: early-abort and batch-fail decisions.
//!
//! Both the generation monitor and the batch evaluator feed scores into the
//! same [`EarlyAbortGate`], so the two real-time gates cannot drift apart.

use serde::{Deserialize, Serialize};

/// Thresholds shared by the real-time and post-hoc gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Number of samples/completions examined by the early-abort check (0 disables).
    pub early_n: usize,
    /// Early abort when every examined score is below `champion - early_delta`.
    pub early_delta: f64,
    /// Batch fails when its best score is below `champion - batch_delta`.
    pub batch_delta: f64,
    /// Confirmations (K) required before a candidate replaces the champion.
    pub confirmations: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            early_n: 4,
            early_delta: 0.8,
            batch_delta: 0.5,
            confirmations: 2,
        }
    }
}

/// Outcome of the early-abort check.
#[derive(Debug, Clone, PartialEq)]
pub enum EarlyAbortDecision {
    /// Fewer than `early_n` samples observed so far.
    Pending { observed: usize },
    /// Evidence is not decisively unfavorable; keep going.
    Proceed,
    /// Every examined sample fell below the threshold.
    Abort { reason: String },
}

/// Decide early abort from the first `early_n` samples.
///
/// Only `samples[..early_n]` is examined, so anything observed after the
/// `early_n`-th sample can never change the decision. `None` samples (failed
/// evaluations) count as below the threshold. Without a champion, or with
/// `early_n == 0`, the gate always proceeds.
pub fn early_abort_decision(
    samples: &[Option<f64>],
    champion: Option<f64>,
    early_n: usize,
    early_delta: f64,
) -> EarlyAbortDecision {
    let Some(champion) = champion else {
        return EarlyAbortDecision::Proceed;
    };
    if early_n == 0 {
        return EarlyAbortDecision::Proceed;
    }
    if samples.len() < early_n {
        return EarlyAbortDecision::Pending {
            observed: samples.len(),
        };
    }
    let threshold = champion - early_delta;
    let window = &samples[..early_n];
    let all_below = window
        .iter()
        .all(|sample| sample.is_none_or(|score| score < threshold));
    if !all_below {
        return EarlyAbortDecision::Proceed;
    }
    let best = window
        .iter()
        .flatten()
        .copied()
        .fold(None, |acc: Option<f64>, score| {
            Some(acc.map_or(score, |a| a.max(score)))
        });
    let reason = match best {
        Some(best) => format!(
            "first {early_n} samples all below {threshold:.4} (champion {champion:.4} - {early_delta}); best {best:.4}"
        ),
        None => format!("first {early_n} samples produced no score"),
    };
    EarlyAbortDecision::Abort { reason }
}

/// Incremental wrapper around [`early_abort_decision`] that latches its verdict.
#[derive(Debug, Clone)]
pub struct EarlyAbortGate {
    champion: Option<f64>,
    early_n: usize,
    early_delta: f64,
    samples: Vec<Option<f64>>,
    decided: Option<EarlyAbortDecision>,
}

impl EarlyAbortGate {
    pub fn new(champion: Option<f64>, early_n: usize, early_delta: f64) -> Self {
        Self {
            champion,
            early_n,
            early_delta,
            samples: Vec::new(),
            decided: None,
        }
    }

    /// Feed one sample; returns the (possibly latched) decision.
    pub fn observe(&mut self, sample: Option<f64>) -> EarlyAbortDecision {
        if let Some(decided) = &self.decided {
            return decided.clone();
        }
        self.samples.push(sample);
        let decision =
            early_abort_decision(&self.samples, self.champion, self.early_n, self.early_delta);
        if !matches!(decision, EarlyAbortDecision::Pending { .. }) {
            self.decided = Some(decision.clone());
        }
        decision
    }

    pub fn is_decided(&self) -> bool {
        self.decided.is_some()
    }

    pub fn samples(&self) -> &[Option<f64>] {
        &self.samples
    }
}

/// Post-hoc batch-fail check. Returns the failure reason when the batch fails.
pub fn batch_fail_reason(
    best_score: Option<f64>,
    champion: Option<f64>,
    batch_delta: f64,
) -> Option<String> {
    let Some(best) = best_score else {
        return Some("no variant produced a score".to_string());
    };
    let champion = champion?;
    let threshold = champion - batch_delta;
    if best < threshold {
        return Some(format!(
            "best {best:.4} below {threshold:.4} (champion {champion:.4} - {batch_delta})"
        ));
    }
    None
}
