//! Evaluation collaborator interface.
//!
//! The collaborator is invoked as `<command> --candidate <path> --tier <tier>`
//! and prints one JSON report as its last stdout line. It never writes loop
//! state; recording results is the loop's job.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use super::process::{ProcessHandle, ProcessSpec};

/// Simulation-count tier requested from the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalTier {
    /// Cheap, noisy screening run.
    Screening,
    /// Expensive run whose score may confirm a promotion.
    Authoritative,
}

impl EvalTier {
    pub fn as_str(self) -> &'static str {
        match self {
            EvalTier::Screening => "screening",
            EvalTier::Authoritative => "authoritative",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalRequest {
    /// Display label (variant name) used in logs.
    pub label: String,
    pub candidate_path: PathBuf,
    pub tier: EvalTier,
}

/// The evaluator's report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub screening_score: f64,
    #[serde(default)]
    pub authoritative_score: Option<f64>,
    #[serde(default)]
    pub robustness_adjustment: f64,
    #[serde(default)]
    pub observed_subfamily: Option<String>,
    #[serde(default)]
    pub diagnostics: Value,
}

impl EvalReport {
    fn check(self) -> Result<Self> {
        let finite = self.screening_score.is_finite()
            && self.robustness_adjustment.is_finite()
            && self.authoritative_score.is_none_or(f64::is_finite);
        if !finite {
            bail!("evaluator reported a non-finite score");
        }
        Ok(self)
    }
}

/// Cancellation signal shared by all workers of one batch. `true` means stop.
pub type CancelSignal = watch::Receiver<bool>;

/// Returned when an evaluation stopped because of the cancel signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationCancelled;

impl fmt::Display for EvaluationCancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("evaluation cancelled")
    }
}

impl std::error::Error for EvaluationCancelled {}

/// Abstraction over evaluation backends. Tests use scripted evaluators.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Evaluate one candidate. Must return [`EvaluationCancelled`] (via
    /// `anyhow`) promptly once `cancel` turns `true`.
    async fn evaluate(&self, request: &EvalRequest, cancel: CancelSignal) -> Result<EvalReport>;
}

/// Parse the report from the last stdout line that holds one.
pub fn parse_report(stdout: &[String]) -> Result<EvalReport> {
    stdout
        .iter()
        .rev()
        .map(|line| line.trim())
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<EvalReport>(line).ok())
        .ok_or_else(|| anyhow!("evaluator printed no JSON report"))?
        .check()
}

/// Evaluator that spawns the configured command.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub grace: Duration,
    pub output_limit_bytes: usize,
}

#[async_trait]
impl Evaluator for CommandEvaluator {
    #[instrument(skip_all, fields(label = %request.label, tier = request.tier.as_str()))]
    async fn evaluate(&self, request: &EvalRequest, mut cancel: CancelSignal) -> Result<EvalReport> {
        if *cancel.borrow() {
            return Err(EvaluationCancelled.into());
        }
        let spec = ProcessSpec::from_command(&self.command)?
            .arg("--candidate")
            .arg(&request.candidate_path)
            .arg("--tier")
            .arg(request.tier.as_str());
        let mut handle = ProcessHandle::start(spec, self.timeout, self.output_limit_bytes)?;

        let deadline = handle.deadline();
        let mut stdout = Vec::new();
        let mut cancel_closed = false;
        loop {
            tokio::select! {
                line = handle.next_line() => match line {
                    Some(line) => stdout.push(line),
                    None => break,
                },
                changed = cancel.changed(), if !cancel_closed => {
                    if changed.is_err() {
                        cancel_closed = true;
                    } else if *cancel.borrow() {
                        debug!("cancel requested, terminating evaluator");
                        handle.cancel(self.grace).await?;
                        return Err(EvaluationCancelled.into());
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        let exit = handle.wait(self.grace).await?;
        if !exit.success() {
            let tail: String = exit.stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
            warn!(outcome = %exit.describe(), "evaluator failed");
            bail!("evaluator {}: {tail}", exit.describe());
        }
        parse_report(&stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_comes_from_last_json_line() {
        let stdout = vec![
            "compiling".to_string(),
            r#"{"screening_score": 1.0}"#.to_string(),
            r#"{"screening_score": 490.5, "authoritative_score": null, "diagnostics": {"sims": 100}}"#
                .to_string(),
            "done".to_string(),
        ];
        let report = parse_report(&stdout).expect("parse");
        assert_eq!(report.screening_score, 490.5);
        assert_eq!(report.authoritative_score, None);
        assert_eq!(report.robustness_adjustment, 0.0);
    }

    #[test]
    fn missing_report_is_an_error() {
        assert!(parse_report(&["no json here".to_string()]).is_err());
    }

    #[test]
    fn cancellation_error_is_downcastable() {
        let err: anyhow::Error = EvaluationCancelled.into();
        assert!(err.downcast_ref::<EvaluationCancelled>().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_evaluator_passes_candidate_and_tier() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("eval.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"{\\\"screening_score\\\": 12.5, \\\"observed_subfamily\\\": \\\"$4\\\"}\"\n",
        )
        .expect("write script");
        let evaluator = CommandEvaluator {
            command: vec!["sh".to_string(), script.to_string_lossy().into_owned()],
            timeout: Duration::from_secs(10),
            grace: Duration::from_secs(1),
            output_limit_bytes: 4096,
        };
        let (_tx, rx) = watch::channel(false);
        let report = evaluator
            .evaluate(
                &EvalRequest {
                    label: "v0".to_string(),
                    candidate_path: temp.path().join("c.txt"),
                    tier: EvalTier::Authoritative,
                },
                rx,
            )
            .await
            .expect("evaluate");
        assert_eq!(report.screening_score, 12.5);
        assert_eq!(report.observed_subfamily.as_deref(), Some("authoritative"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_evaluator_stops_on_cancel() {
        let evaluator = CommandEvaluator {
            command: vec!["sh".to_string(), "-c".to_string(), "exec sleep 30".to_string()],
            timeout: Duration::from_secs(60),
            grace: Duration::from_millis(500),
            output_limit_bytes: 4096,
        };
        let (tx, rx) = watch::channel(false);
        let request = EvalRequest {
            label: "v0".to_string(),
            candidate_path: PathBuf::from("c.txt"),
            tier: EvalTier::Screening,
        };
        let task = tokio::spawn(async move { evaluator.evaluate(&request, rx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).expect("send");
        let err = task.await.expect("join").unwrap_err();
        assert!(err.downcast_ref::<EvaluationCancelled>().is_some());
    }
}
