//! Test-only collaborators and state fixtures.
//!
//! [`ScriptedGenerator`] and [`ScriptedEvaluator`] stand in for the external
//! subprocesses so loop behavior can be exercised deterministically.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::time::Instant;

use crate::io::config::LoopConfig;
use crate::io::evaluator::{
    CancelSignal, EvalReport, EvalRequest, EvalTier, EvaluationCancelled, Evaluator,
};
use crate::io::generator::{GenerateRequest, GenerationSession, Generator, SessionExit};
use crate::io::init::{StatePaths, init_state};
use crate::io::store::StateStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One scripted generation session.
#[derive(Debug, Clone, Default)]
pub struct ScriptedGeneration {
    pub lines: Vec<String>,
    pub line_delay: Duration,
    /// Written to the artifact path when the session exits successfully.
    pub artifact: Option<Value>,
    /// Written to the checkpoint path as soon as the session starts.
    pub checkpoint: Option<Value>,
    /// Keep the stream open after the scripted lines until cancelled.
    pub hang: bool,
    /// Non-empty means the session exits with a failure and this stderr.
    pub crash: Option<String>,
}

impl ScriptedGeneration {
    pub fn with_artifact(artifact: Value) -> Self {
        Self {
            artifact: Some(artifact),
            ..Self::default()
        }
    }

    pub fn candidate(name: &str, source: &str) -> Self {
        Self::with_artifact(json!({"name": name, "source": source}))
    }

    /// A family artifact with one variant per `(name, source)` pair.
    pub fn family(name: &str, variants: &[(&str, &str)]) -> Self {
        let variants: Vec<Value> = variants
            .iter()
            .map(|(name, source)| json!({"name": name, "source": source}))
            .collect();
        Self::with_artifact(json!({
            "name": name,
            "source": variants.first().and_then(|v| v.get("source")).cloned().unwrap_or_else(|| json!("")),
            "variants": variants,
        }))
    }

    pub fn hanging_session() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn crashing(stderr: &str) -> Self {
        Self {
            crash: Some(stderr.to_string()),
            ..Self::default()
        }
    }

    pub fn with_lines<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lines.extend(lines.into_iter().map(Into::into));
        self
    }

    pub fn with_line_delay(mut self, delay: Duration) -> Self {
        self.line_delay = delay;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: Value) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }
}

/// Generator that replays queued [`ScriptedGeneration`]s in order.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    queue: Mutex<VecDeque<ScriptedGeneration>>,
    requests: Mutex<Vec<GenerateRequest>>,
    cancels: Arc<AtomicUsize>,
}

impl ScriptedGenerator {
    pub fn new(scripts: impl IntoIterator<Item = ScriptedGeneration>) -> Self {
        Self {
            queue: Mutex::new(scripts.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn push(&self, script: ScriptedGeneration) {
        lock(&self.queue).push_back(script);
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        lock(&self.requests).clone()
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        lock(&self.queue).len()
    }
}

impl Generator for ScriptedGenerator {
    fn start(&self, request: &GenerateRequest) -> Result<Box<dyn GenerationSession>> {
        let script = lock(&self.queue)
            .pop_front()
            .ok_or_else(|| anyhow!("scripted generator exhausted"))?;
        lock(&self.requests).push(request.clone());
        if let Some(checkpoint) = &script.checkpoint {
            fs::write(&request.checkpoint_path, checkpoint.to_string())?;
        }
        Ok(Box::new(ScriptedSession {
            lines: script.lines.into_iter().collect(),
            line_delay: script.line_delay,
            artifact: script.artifact,
            artifact_path: request.artifact_path.clone(),
            hang: script.hang,
            crash: script.crash,
            deadline: Instant::now() + request.timeout,
            cancelled: false,
            cancels: Arc::clone(&self.cancels),
        }))
    }
}

struct ScriptedSession {
    lines: VecDeque<String>,
    line_delay: Duration,
    artifact: Option<Value>,
    artifact_path: PathBuf,
    hang: bool,
    crash: Option<String>,
    deadline: Instant,
    cancelled: bool,
    cancels: Arc<AtomicUsize>,
}

#[async_trait]
impl GenerationSession for ScriptedSession {
    async fn next_line(&mut self) -> Option<String> {
        if self.cancelled {
            return None;
        }
        if let Some(line) = self.lines.pop_front() {
            if !self.line_delay.is_zero() {
                tokio::time::sleep(self.line_delay).await;
            }
            return Some(line);
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        None
    }

    fn deadline(&self) -> Instant {
        self.deadline
    }

    async fn cancel(&mut self) -> Result<()> {
        if !self.cancelled {
            self.cancelled = true;
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<SessionExit> {
        if self.cancelled {
            return Ok(SessionExit {
                cancelled: true,
                summary: "cancelled".to_string(),
                ..SessionExit::default()
            });
        }
        if let Some(stderr) = &self.crash {
            return Ok(SessionExit {
                summary: "exit code 1".to_string(),
                stderr: stderr.clone(),
                ..SessionExit::default()
            });
        }
        if let Some(artifact) = &self.artifact {
            fs::write(&self.artifact_path, artifact.to_string())?;
        }
        Ok(SessionExit {
            success: true,
            summary: "exit code 0".to_string(),
            ..SessionExit::default()
        })
    }
}

/// Scripted evaluator response for one label.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEval {
    pub screening: f64,
    /// Score reported at the authoritative tier (defaults to `screening`).
    pub confirm: Option<f64>,
    /// Report an authoritative score at every tier.
    pub always_authoritative: bool,
    pub robustness_adjustment: f64,
    pub observed_subfamily: Option<String>,
    pub delay: Option<Duration>,
    pub failure: Option<String>,
    pub panic: bool,
}

impl ScriptedEval {
    pub fn score(screening: f64) -> Self {
        Self {
            screening,
            ..Self::default()
        }
    }

    pub fn authoritative(score: f64) -> Self {
        Self {
            screening: score,
            always_authoritative: true,
            ..Self::default()
        }
    }

    pub fn failure(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn panic() -> Self {
        Self {
            panic: true,
            ..Self::default()
        }
    }

    pub fn confirmed_at(mut self, score: f64) -> Self {
        self.confirm = Some(score);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn observing(mut self, subfamily: &str) -> Self {
        self.observed_subfamily = Some(subfamily.to_string());
        self
    }

    fn report(&self, tier: EvalTier) -> EvalReport {
        let authoritative = match tier {
            EvalTier::Authoritative => Some(self.confirm.unwrap_or(self.screening)),
            EvalTier::Screening => self.always_authoritative.then_some(self.screening),
        };
        EvalReport {
            screening_score: self.screening,
            authoritative_score: authoritative,
            robustness_adjustment: self.robustness_adjustment,
            observed_subfamily: self.observed_subfamily.clone(),
            diagnostics: Value::Null,
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Evaluator answering from a per-label script, with an optional fallback.
#[derive(Debug, Default)]
pub struct ScriptedEvaluator {
    scripts: HashMap<String, ScriptedEval>,
    fallback: Option<ScriptedEval>,
    calls: Mutex<Vec<(String, EvalTier)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedEvaluator {
    pub fn new<K: Into<String>>(scripts: impl IntoIterator<Item = (K, ScriptedEval)>) -> Self {
        Self {
            scripts: scripts
                .into_iter()
                .map(|(label, script)| (label.into(), script))
                .collect(),
            ..Self::default()
        }
    }

    /// Answer every label with `script`.
    pub fn uniform(script: ScriptedEval) -> Self {
        Self {
            fallback: Some(script),
            ..Self::default()
        }
    }

    pub fn with_fallback(mut self, script: ScriptedEval) -> Self {
        self.fallback = Some(script);
        self
    }

    pub fn calls(&self) -> Vec<(String, EvalTier)> {
        lock(&self.calls).clone()
    }

    pub fn was_called(&self, label: &str) -> bool {
        lock(&self.calls).iter().any(|(called, _)| called == label)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

async fn cancelled(mut cancel: CancelSignal) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(&self, request: &EvalRequest, cancel: CancelSignal) -> Result<EvalReport> {
        lock(&self.calls).push((request.label.clone(), request.tier));
        let script = self
            .scripts
            .get(&request.label)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| anyhow!("no scripted evaluation for {}", request.label))?;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if script.panic {
            panic!("scripted evaluator panic for {}", request.label);
        }
        if let Some(delay) = script.delay {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancelled(cancel) => return Err(EvaluationCancelled.into()),
            }
        } else {
            tokio::task::yield_now().await;
        }
        if let Some(message) = &script.failure {
            bail!("evaluator crashed: {message}");
        }
        Ok(script.report(request.tier))
    }
}

/// A fresh, initialized state directory.
pub struct TestState {
    pub temp: TempDir,
    pub paths: StatePaths,
    pub store: StateStore,
}

impl TestState {
    pub fn new(baseline_score: Option<f64>) -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let dir = temp.path().join("state");
        init_state(&dir, baseline_score)?;
        Ok(Self {
            paths: StatePaths::new(&dir),
            store: StateStore::new(&dir),
            temp,
        })
    }

    /// Configuration with zero pacing and short timeouts.
    pub fn config(&self) -> LoopConfig {
        let mut config = LoopConfig {
            min_delay_secs: 0,
            ..LoopConfig::default()
        };
        config.generator.timeout_secs = 60;
        config.generator.grace_secs = 0;
        config.evaluator.grace_secs = 0;
        config
    }
}
