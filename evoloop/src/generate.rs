//! Generation controller with a live early-abort monitor.
//!
//! The controller tails the collaborator's event stream while the hard
//! deadline runs. Authoritative interim scores feed the same
//! [`EarlyAbortGate`] the batch evaluator uses; once it aborts, the session is
//! cancelled instead of waiting out the timeout. On timeout the most recent
//! checkpoint is recovered when one exists.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::gates::{EarlyAbortDecision, EarlyAbortGate, GateConfig};
use crate::core::types::EarlyAbortRecord;
use crate::io::generator::{
    Artifact, GenerateRequest, GenerationEvent, GenerationSession, Generator, SessionExit,
    load_artifact, load_checkpoint, parse_event_line,
};

pub const TRANSCRIPT_FILE: &str = "transcript.jsonl";
pub const GENERATOR_LOG_FILE: &str = "generator.log";

/// What a generation attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Produced {
        artifact: Artifact,
        recovered_from_checkpoint: bool,
    },
    /// The monitor stopped the session on unfavorable interim scores.
    EarlyAbort { reason: String },
    /// Crash, timeout without checkpoint, or no output.
    Failed { reason: String },
    /// Output existed but did not parse into a valid artifact.
    Unparseable { reason: String },
}

#[derive(Debug, Clone)]
pub struct GenerationReport {
    pub outcome: GenerationOutcome,
    pub early_abort: EarlyAbortRecord,
    pub interim_scores: Vec<f64>,
    pub exit: SessionExit,
    pub timed_out: bool,
}

#[derive(Serialize)]
struct TranscriptEntry<'a> {
    at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'a GenerationEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

struct Transcript {
    started: Instant,
    out: BufWriter<File>,
}

impl Transcript {
    fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        Ok(Self {
            started: Instant::now(),
            out: BufWriter::new(file),
        })
    }

    fn record(&mut self, line: &str, event: Option<&GenerationEvent>) -> Result<()> {
        let entry = TranscriptEntry {
            at_ms: self.started.elapsed().as_millis() as u64,
            event,
            text: event.is_none().then_some(line),
        };
        serde_json::to_writer(&mut self.out, &entry).context("encode transcript entry")?;
        self.out.write_all(b"\n").context("write transcript")?;
        self.out.flush().context("flush transcript")
    }
}

enum Tick {
    Line(Option<String>),
    Deadline,
}

/// Run one generation attempt and classify what it produced.
///
/// Only transcript I/O errors are returned as `Err`; every collaborator
/// failure is reported through [`GenerationOutcome`].
#[instrument(skip_all, fields(iteration = request.iteration))]
pub async fn generate(
    generator: &dyn Generator,
    request: &GenerateRequest,
    champion: Option<f64>,
    gates: &GateConfig,
    iteration_dir: &Path,
) -> Result<GenerationReport> {
    fs::create_dir_all(iteration_dir)
        .with_context(|| format!("create {}", iteration_dir.display()))?;
    let mut session = match generator.start(request) {
        Ok(session) => session,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "generation collaborator failed to start");
            return Ok(GenerationReport {
                outcome: GenerationOutcome::Failed {
                    reason: format!("failed to start generator: {err:#}"),
                },
                early_abort: EarlyAbortRecord::default(),
                interim_scores: Vec::new(),
                exit: SessionExit::default(),
                timed_out: false,
            });
        }
    };

    let mut transcript = Transcript::create(&iteration_dir.join(TRANSCRIPT_FILE))?;
    let mut gate = EarlyAbortGate::new(champion, gates.early_n, gates.early_delta);
    let mut interim_scores = Vec::new();
    let mut announced_checkpoint: Option<PathBuf> = None;
    let mut abort_reason = None;
    let mut timed_out = false;

    let deadline = session.deadline();
    loop {
        let tick = tokio::select! {
            line = session.next_line() => Tick::Line(line),
            () = tokio::time::sleep_until(deadline) => Tick::Deadline,
        };
        let line = match tick {
            Tick::Line(Some(line)) => line,
            Tick::Line(None) => break,
            Tick::Deadline => {
                warn!(timeout_secs = request.timeout.as_secs(), "generation timed out");
                timed_out = true;
                session.cancel().await?;
                break;
            }
        };
        let event = parse_event_line(&line);
        transcript.record(&line, event.as_ref())?;
        match event {
            Some(GenerationEvent::InterimScore {
                score,
                authoritative,
            }) => {
                interim_scores.push(score);
                if !authoritative || gate.is_decided() {
                    continue;
                }
                if let EarlyAbortDecision::Abort { reason } = gate.observe(Some(score)) {
                    info!(%reason, "early abort, cancelling generation");
                    session.cancel().await?;
                    abort_reason = Some(reason);
                    break;
                }
            }
            Some(GenerationEvent::Checkpoint { path }) => {
                debug!(path = %path.display(), "checkpoint announced");
                announced_checkpoint = Some(path);
            }
            Some(GenerationEvent::Message { .. }) | None => {}
        }
    }

    let exit = session.finish().await?;
    let log = format!("{}\n{}", exit.summary, exit.stderr);
    fs::write(iteration_dir.join(GENERATOR_LOG_FILE), log)
        .with_context(|| format!("write {GENERATOR_LOG_FILE}"))?;
    let timed_out = timed_out || exit.timed_out;

    let outcome = if let Some(reason) = &abort_reason {
        GenerationOutcome::EarlyAbort {
            reason: reason.clone(),
        }
    } else if timed_out {
        let checkpoint = announced_checkpoint.unwrap_or_else(|| request.checkpoint_path.clone());
        recover_checkpoint(&checkpoint, request.timeout.as_secs())
    } else if !exit.success {
        GenerationOutcome::Failed {
            reason: format!("generator {}{}", exit.summary, stderr_tail(&exit.stderr)),
        }
    } else if !request.artifact_path.exists() {
        GenerationOutcome::Failed {
            reason: format!(
                "generator produced no artifact at {}",
                request.artifact_path.display()
            ),
        }
    } else {
        match load_artifact(&request.artifact_path) {
            Ok(artifact) => GenerationOutcome::Produced {
                artifact,
                recovered_from_checkpoint: false,
            },
            Err(err) => GenerationOutcome::Unparseable {
                reason: format!("{err:#}"),
            },
        }
    };

    Ok(GenerationReport {
        outcome,
        early_abort: EarlyAbortRecord {
            triggered: abort_reason.is_some(),
            reason: abort_reason,
        },
        interim_scores,
        exit,
        timed_out,
    })
}

fn recover_checkpoint(path: &Path, timeout_secs: u64) -> GenerationOutcome {
    if !path.exists() {
        return GenerationOutcome::Failed {
            reason: format!("timed out after {timeout_secs}s with no recoverable checkpoint"),
        };
    }
    match load_checkpoint(path) {
        Ok(checkpoint) => {
            info!(
                path = %path.display(),
                best_score = ?checkpoint.best_score,
                "recovered candidate from checkpoint"
            );
            GenerationOutcome::Produced {
                artifact: checkpoint.best,
                recovered_from_checkpoint: true,
            }
        }
        Err(err) => GenerationOutcome::Failed {
            reason: format!("timed out after {timeout_secs}s; checkpoint unusable: {err:#}"),
        },
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let tail: Vec<&str> = trimmed.lines().rev().take(5).collect();
    let tail: Vec<&str> = tail.into_iter().rev().collect();
    format!(": {}", tail.join(" | "))
}
