//! Generation collaborator interface: typed events, sessions, and artifacts.
//!
//! The collaborator receives the prompt on stdin and reports progress as
//! JSON lines on stdout:
//!
//! ```text
//! {"type":"message","text":"trying a convex fee curve"}
//! {"type":"interim_score","score":493.1,"authoritative":true}
//! {"type":"checkpoint","path":"/state/iterations/7/checkpoint.json"}
//! ```
//!
//! Its final output is an artifact JSON file at `EVOLOOP_ARTIFACT_PATH`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, instrument};

use super::process::{ProcessHandle, ProcessSpec};
use crate::core::types::{IterationId, Plan};

const ARTIFACT_SCHEMA: &str = include_str!("../schemas/artifact.schema.json");

/// One structured event from the generator's stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    Message {
        text: String,
    },
    InterimScore {
        score: f64,
        #[serde(default)]
        authoritative: bool,
    },
    Checkpoint {
        path: PathBuf,
    },
}

/// Parse one stdout line; anything that is not a known event is plain text.
pub fn parse_event_line(line: &str) -> Option<GenerationEvent> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Everything the collaborator needs for one iteration.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub iteration: IterationId,
    pub prompt: String,
    pub plan: Plan,
    pub artifact_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub timeout: Duration,
    pub grace: Duration,
}

/// How a session ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionExit {
    pub success: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    pub summary: String,
    pub stderr: String,
}

/// A running generation attempt.
#[async_trait]
pub trait GenerationSession: Send {
    /// Next stdout line; `None` once the stream is closed.
    async fn next_line(&mut self) -> Option<String>;

    /// Hard wall-clock deadline of this session.
    fn deadline(&self) -> Instant;

    /// Cooperative terminate with forced kill after the grace window. Idempotent.
    async fn cancel(&mut self) -> Result<()>;

    /// Wait for exit (enforcing the deadline).
    async fn finish(&mut self) -> Result<SessionExit>;
}

/// Abstraction over generation backends. Tests use scripted generators.
pub trait Generator: Send + Sync {
    fn start(&self, request: &GenerateRequest) -> Result<Box<dyn GenerationSession>>;
}

/// Generator that spawns the configured command.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    pub command: Vec<String>,
    pub output_limit_bytes: usize,
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(iteration = request.iteration))]
    fn start(&self, request: &GenerateRequest) -> Result<Box<dyn GenerationSession>> {
        info!(command = ?self.command, "starting generation collaborator");
        let mut spec = ProcessSpec::from_command(&self.command)?
            .env("EVOLOOP_ITERATION", request.iteration.to_string())
            .env(
                "EVOLOOP_ARTIFACT_PATH",
                request.artifact_path.to_string_lossy(),
            )
            .env(
                "EVOLOOP_CHECKPOINT_PATH",
                request.checkpoint_path.to_string_lossy(),
            )
            .env(
                "EVOLOOP_OPPORTUNITY",
                request.plan.opportunity_id.clone().unwrap_or_default(),
            );
        spec.stdin = Some(request.prompt.clone().into_bytes());
        let handle = ProcessHandle::start(spec, request.timeout, self.output_limit_bytes)?;
        Ok(Box::new(CommandSession {
            handle,
            grace: request.grace,
        }))
    }
}

struct CommandSession {
    handle: ProcessHandle,
    grace: Duration,
}

#[async_trait]
impl GenerationSession for CommandSession {
    async fn next_line(&mut self) -> Option<String> {
        self.handle.next_line().await
    }

    fn deadline(&self) -> Instant {
        self.handle.deadline()
    }

    async fn cancel(&mut self) -> Result<()> {
        self.handle.cancel(self.grace).await
    }

    async fn finish(&mut self) -> Result<SessionExit> {
        let exit = self.handle.wait(self.grace).await?;
        Ok(SessionExit {
            success: exit.success(),
            timed_out: exit.timed_out,
            cancelled: exit.cancelled,
            summary: exit.describe(),
            stderr: exit.stderr,
        })
    }
}

/// Final output of the generation collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    #[serde(default)]
    pub hypothesis_tags: Vec<String>,
    #[serde(default)]
    pub expected_range: Option<[f64; 2]>,
    pub source: String,
    #[serde(default)]
    pub subfamily: Option<String>,
    #[serde(default)]
    pub variants: Vec<ArtifactVariant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactVariant {
    pub name: String,
    pub source: String,
}

/// Partial progress persisted by the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub best: Artifact,
    #[serde(default)]
    pub best_score: Option<f64>,
}

fn validate_artifact_value(value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(ARTIFACT_SCHEMA).context("parse artifact schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile artifact schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("artifact schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

fn parse_artifact_value(value: Value) -> Result<Artifact> {
    validate_artifact_value(&value)?;
    let artifact: Artifact = serde_json::from_value(value).context("deserialize artifact")?;
    if let Some([low, high]) = artifact.expected_range
        && low > high
    {
        return Err(anyhow!("expected_range [{low}, {high}] is inverted"));
    }
    Ok(artifact)
}

/// Load and validate an artifact file.
pub fn load_artifact(path: &Path) -> Result<Artifact> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read artifact {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse artifact {}", path.display()))?;
    parse_artifact_value(value).with_context(|| format!("validate artifact {}", path.display()))
}

/// Load a checkpoint's best artifact.
pub fn load_checkpoint(path: &Path) -> Result<CheckpointFile> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read checkpoint {}", path.display()))?;
    let mut value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse checkpoint {}", path.display()))?;
    let best = value
        .get_mut("best")
        .map(Value::take)
        .ok_or_else(|| anyhow!("checkpoint {} has no best artifact", path.display()))?;
    let best = parse_artifact_value(best)
        .with_context(|| format!("validate checkpoint {}", path.display()))?;
    let best_score = value.get("best_score").and_then(Value::as_f64);
    Ok(CheckpointFile { best, best_score })
}
