//! Autonomous search-evaluate-promote loop.
//!
//! Drives an external generator and evaluator against a crash-resumable state
//! directory (`.evoloop/` by default), promoting candidates that clear the
//! configured gates.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use evoloop::exit_codes;
use evoloop::io::config::{LoopConfig, RunOverrides, load_config};
use evoloop::io::evaluator::CommandEvaluator;
use evoloop::io::generator::CommandGenerator;
use evoloop::io::init::{StatePaths, init_paths};
use evoloop::io::process::resolve_program;
use evoloop::looping::run_loop;
use evoloop::select::select_next;
use evoloop::step::Collaborators;
use evoloop::validate::validate_state;

#[derive(Parser)]
#[command(
    name = "evoloop",
    version,
    about = "Autonomous search-evaluate-promote loop"
)]
struct Cli {
    /// State directory.
    #[arg(long, global = true, default_value = ".evoloop")]
    state_dir: PathBuf,
    /// Config file (defaults to `<state-dir>/config.toml`). `init` creates it
    /// here when missing.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or repair the state directory. Re-running on valid state is a no-op.
    Init {
        /// Seed the champion with this score when none exists.
        #[arg(long)]
        baseline_score: Option<f64>,
    },
    /// Run iterations until a stop condition holds.
    Run(RunArgs),
    /// Print the plan the next iteration would use, as JSON.
    Select,
    /// Check documents, config, and cross-document consistency.
    Validate,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Stop once the iteration counter reaches this (counts across restarts).
    #[arg(long)]
    max_iterations: Option<u64>,
    /// Stop once this many seconds have passed since the first run.
    #[arg(long)]
    max_runtime_secs: Option<u64>,
    /// Stop once the champion's effective score reaches this.
    #[arg(long)]
    target_score: Option<f64>,
    /// Samples/completions examined by the early-abort gate.
    #[arg(long)]
    early_n: Option<usize>,
    #[arg(long)]
    early_delta: Option<f64>,
    #[arg(long)]
    batch_delta: Option<f64>,
    /// Confirmations (K) required before promotion.
    #[arg(long)]
    confirmations: Option<u32>,
    #[arg(long)]
    ewma_alpha: Option<f64>,
    #[arg(long)]
    ewma_penalty: Option<f64>,
    #[arg(long)]
    exploration_lookback: Option<usize>,
    #[arg(long)]
    exploration_epsilon: Option<f64>,
    /// No-uplift outcomes within the lookback that count as a stall.
    #[arg(long)]
    stall_min_no_uplift: Option<usize>,
    /// Concurrent evaluation workers.
    #[arg(long)]
    workers: Option<usize>,
    /// Minimum seconds between generator calls.
    #[arg(long)]
    min_delay_secs: Option<u64>,
    #[arg(long)]
    generation_timeout_secs: Option<u64>,
    /// Seed the champion with this score when none exists.
    #[arg(long)]
    baseline_score: Option<f64>,
}

impl From<RunArgs> for RunOverrides {
    fn from(args: RunArgs) -> Self {
        Self {
            max_iterations: args.max_iterations,
            max_runtime_secs: args.max_runtime_secs,
            target_score: args.target_score,
            early_n: args.early_n,
            early_delta: args.early_delta,
            batch_delta: args.batch_delta,
            confirmations: args.confirmations,
            ewma_alpha: args.ewma_alpha,
            ewma_penalty: args.ewma_penalty,
            exploration_lookback: args.exploration_lookback,
            exploration_epsilon: args.exploration_epsilon,
            stall_min_no_uplift: args.stall_min_no_uplift,
            workers: args.workers,
            min_delay_secs: args.min_delay_secs,
            generation_timeout_secs: args.generation_timeout_secs,
            baseline_score: args.baseline_score,
        }
    }
}

fn main() {
    evoloop::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::FAILURE);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let mut paths = StatePaths::new(&cli.state_dir);
    if let Some(config) = cli.config {
        paths = paths.with_config(config);
    }
    match cli.command {
        Command::Init { baseline_score } => cmd_init(&paths, baseline_score),
        Command::Run(args) => cmd_run(&paths, args.into()),
        Command::Select => cmd_select(&paths),
        Command::Validate => cmd_validate(&paths),
    }
}

fn cmd_init(paths: &StatePaths, baseline_score: Option<f64>) -> Result<i32> {
    let report = init_paths(paths, baseline_score)?;
    if report.is_noop() {
        println!("state directory {} already valid", paths.dir.display());
        return Ok(exit_codes::OK);
    }
    for file in report.changed() {
        println!("wrote {file}");
    }
    for file in report.repaired() {
        println!("repaired {file} (previous content kept as {file}.corrupt)");
    }
    if report.config_created {
        println!("wrote {}", paths.config_path.display());
    }
    if report.seeded_champion {
        println!("seeded champion from baseline score");
    }
    Ok(exit_codes::OK)
}

fn load_validated(config_path: &Path, overrides: RunOverrides) -> Result<LoopConfig> {
    let mut config = load_config(config_path)?;
    config.apply(overrides);
    config
        .validate()
        .with_context(|| format!("invalid config {}", config_path.display()))?;
    Ok(config)
}

fn require_collaborator(label: &str, command: &[String]) -> Result<()> {
    let program = command
        .first()
        .ok_or_else(|| anyhow!("{label} command is empty"))?;
    if resolve_program(program).is_none() {
        bail!("{label} collaborator {program:?} not found");
    }
    Ok(())
}

fn cmd_run(paths: &StatePaths, overrides: RunOverrides) -> Result<i32> {
    let baseline = overrides.baseline_score;
    let config = load_validated(&paths.config_path, overrides)?;
    init_paths(paths, baseline.or(config.baseline_score))
        .context("state directory is not repairable")?;
    require_collaborator("generator", &config.generator.command)?;
    require_collaborator("evaluator", &config.evaluator.command)?;

    let generator = CommandGenerator {
        command: config.generator.command.clone(),
        output_limit_bytes: config.generator.output_limit_bytes,
    };
    let collaborators = Collaborators {
        generator: &generator,
        evaluator: Arc::new(CommandEvaluator {
            command: config.evaluator.command.clone(),
            timeout: Duration::from_secs(config.evaluator.timeout_secs),
            grace: Duration::from_secs(config.evaluator.grace_secs),
            output_limit_bytes: config.evaluator.output_limit_bytes,
        }),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    let outcome = runtime.block_on(run_loop(paths, &config, &collaborators, |step| {
        let record = &step.record;
        let score = record
            .effective_score
            .map_or_else(|| "-".to_string(), |score| format!("{score:.4}"));
        let error = record
            .error
            .as_ref()
            .map(|error| format!(" {}: {}", error.stage.as_str(), error.message))
            .unwrap_or_default();
        println!(
            "iteration {} {:?} score {score}{}{error}",
            record.id,
            record.status,
            if record.promoted { " (promoted)" } else { "" },
        );
    }))?;

    println!(
        "stopped after {} iteration(s): {:?}",
        outcome.iterations_run, outcome.stop
    );
    Ok(exit_codes::OK)
}

fn cmd_select(paths: &StatePaths) -> Result<i32> {
    let config = load_validated(&paths.config_path, RunOverrides::default())?;
    let report = select_next(paths, &config)?;
    let json = serde_json::to_string_pretty(&report).context("serialize plan")?;
    println!("{json}");
    Ok(exit_codes::OK)
}

fn cmd_validate(paths: &StatePaths) -> Result<i32> {
    let outcome = validate_state(paths)?;
    if outcome.is_consistent() {
        println!("ok");
        return Ok(exit_codes::OK);
    }
    for problem in &outcome.problems {
        println!("- {problem}");
    }
    Ok(exit_codes::FAILURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_with_baseline() {
        let cli = Cli::parse_from(["evoloop", "init", "--baseline-score", "480"]);
        assert!(matches!(
            cli.command,
            Command::Init {
                baseline_score: Some(score)
            } if score == 480.0
        ));
        assert_eq!(cli.state_dir, PathBuf::from(".evoloop"));
    }

    #[test]
    fn parse_run_flags_into_overrides() {
        let cli = Cli::parse_from([
            "evoloop",
            "--state-dir",
            "/tmp/s",
            "run",
            "--max-iterations",
            "20",
            "--early-n",
            "3",
            "--confirmations",
            "3",
            "--stall-min-no-uplift",
            "5",
        ]);
        assert_eq!(cli.state_dir, PathBuf::from("/tmp/s"));
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let overrides = RunOverrides::from(args);
        assert_eq!(overrides.max_iterations, Some(20));
        assert_eq!(overrides.early_n, Some(3));
        assert_eq!(overrides.confirmations, Some(3));
        assert_eq!(overrides.stall_min_no_uplift, Some(5));
        assert_eq!(overrides.target_score, None);
    }

    #[test]
    fn missing_collaborator_is_a_startup_failure() {
        let err = require_collaborator("generator", &["definitely-not-a-real-binary-xyz".to_string()])
            .expect_err("missing");
        assert!(err.to_string().contains("not found"));
    }
}
