//! CLI command definitions for refine-harness.
//!
//! Three subcommands share one binary: `refine` batch-runs the SysML refiner
//! over numbered prompts, `eval` scores generated models with an LLM judge,
//! and `difficulty` aggregates those scores per difficulty bucket.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::error::{LlmError, SchedulerError};
use crate::eval::{run_difficulty, run_evaluation, EvalConfig};
use crate::llm::{ChatClient, LlmProvider, DEFAULT_API_BASE};
use crate::runner::{
    CommandRefiner, RefineConfig, RefinerOptions, RetryingRunner, SubprocessEnv, UnitRunner,
    ValidateWith,
};
use crate::scheduler::{select_units, BatchScheduler};
use crate::session::{SessionManifestWriter, StatusCounts};

/// Default evaluation-ready output root.
const DEFAULT_OUTPUT_ROOT: &str = "Generated_from_Prompts_API_LOOP";

/// Benchmark harness for the SysML refiner.
#[derive(Parser)]
#[command(name = "refine-harness")]
#[command(about = "Batch-run the SysML refiner over numbered prompts and score the results")]
#[command(version)]
#[command(
    long_about = "refine-harness drives an external SysML refiner across a numbered prompt corpus, \
retries failures, and keeps a resumable session manifest plus timing reports.\n\n\
Example usage:\n  refine-harness refine --start-id 1 --end-id 20 --parallelism 4\n  \
refine-harness eval --generated-root Generated_from_Prompts_API_LOOP\n  \
refine-harness difficulty --scores-root Generated_from_Prompts_API_LOOP"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the refiner over a range of prompt IDs.
    Refine(Box<RefineArgs>),

    /// Score generated models for precision and recall with an LLM judge.
    Eval(EvalArgs),

    /// Average evaluation scores per difficulty bucket.
    Difficulty(DifficultyArgs),
}

/// Arguments for `refine-harness refine`.
#[derive(Parser, Debug)]
pub struct RefineArgs {
    /// Root containing per-ID prompt folders with nl.txt.
    #[arg(long, default_value = "nl_prompts")]
    pub prompts_root: PathBuf,

    /// Root containing ground-truth sample folders.
    #[arg(long, default_value = "sysmbench_original_upstream/dataset/sysml/samples")]
    pub samples_root: PathBuf,

    /// Evaluation-ready output root.
    #[arg(long, default_value = DEFAULT_OUTPUT_ROOT)]
    pub output_root: PathBuf,

    /// Raw refiner run artifacts root.
    #[arg(long, default_value = "runs/refine_api_loop")]
    pub refine_runs_root: PathBuf,

    /// Refiner entry script.
    #[arg(long, default_value = "refine_sysml.py")]
    pub refine_script: PathBuf,

    /// Virtual environment forwarded to the refiner.
    #[arg(long, default_value = ".venv")]
    pub venv: PathBuf,

    /// Interpreter override (defaults to <venv>/bin/python).
    #[arg(long)]
    pub python: Option<PathBuf>,

    /// Env file merged into the refiner environment.
    #[arg(long, default_value = ".env")]
    pub env_file: PathBuf,

    /// Smallest prompt ID to run.
    #[arg(long, default_value = "1")]
    pub start_id: u32,

    /// Largest prompt ID to run.
    #[arg(long, default_value = "151")]
    pub end_id: u32,

    /// Prompt IDs to skip (e.g. --skip 3 7 11).
    #[arg(long, num_args = 0..)]
    pub skip: Vec<u32>,

    /// Units per batch; batches run strictly in order.
    #[arg(long, default_value = "30")]
    pub batch_size: usize,

    /// Units in flight within a batch.
    #[arg(short = 'j', long, default_value = "1")]
    pub parallelism: usize,

    /// Extra attempts per failed unit.
    #[arg(long, default_value = "4")]
    pub id_retries: u32,

    /// Model the refiner calls.
    #[arg(short = 'm', long, default_value = "gpt-5-mini")]
    pub model: String,

    /// Maximum refinement iterations per unit.
    #[arg(long, default_value = "5")]
    pub max_iters: u32,

    /// Sampling temperature (refiner default when omitted).
    #[arg(long)]
    pub temperature: Option<f64>,

    /// Token budget per unit.
    #[arg(long, default_value = "50000")]
    pub max_total_tokens: u64,

    #[arg(long, default_value = "8")]
    pub api_max_retries: u32,

    #[arg(long, default_value = "2.0")]
    pub api_retry_backoff_seconds: f64,

    #[arg(long, default_value = "30.0")]
    pub api_retry_max_backoff_seconds: f64,

    #[arg(long, default_value = "120.0")]
    pub api_timeout_seconds: f64,

    #[arg(long, default_value = "60")]
    pub syside_timeout_seconds: u64,

    /// Validation mode used by the refiner.
    #[arg(long, value_enum, default_value = "format")]
    pub syside_validate_with: ValidateWith,

    /// Optional SysML example snippet for the refiner prompt.
    #[arg(long)]
    pub example: Option<PathBuf>,

    /// Re-run units even when a successful result exists.
    #[arg(long)]
    pub overwrite: bool,

    /// Stop dispatching after the first unit that fails all attempts.
    #[arg(long)]
    pub stop_on_error: bool,

    /// Ask the refiner to skip API and compiler calls.
    #[arg(long)]
    pub dry_run: bool,

    /// Print the session summary as JSON.
    #[arg(long)]
    pub json: bool,
}

impl RefineArgs {
    /// Builds the unresolved session configuration.
    pub fn to_config(&self) -> RefineConfig {
        let refiner = RefinerOptions {
            model: self.model.clone(),
            max_iters: self.max_iters,
            temperature: self.temperature,
            max_total_tokens: self.max_total_tokens,
            api_max_retries: self.api_max_retries,
            api_retry_backoff_seconds: self.api_retry_backoff_seconds,
            api_retry_max_backoff_seconds: self.api_retry_max_backoff_seconds,
            api_timeout_seconds: self.api_timeout_seconds,
            syside_timeout_seconds: self.syside_timeout_seconds,
            syside_validate_with: self.syside_validate_with,
            example: self.example.clone(),
            dry_run: self.dry_run,
        };
        let mut config = RefineConfig::new(&self.output_root)
            .with_prompts_root(&self.prompts_root)
            .with_samples_root(&self.samples_root)
            .with_refine_runs_root(&self.refine_runs_root)
            .with_refine_script(&self.refine_script)
            .with_id_range(self.start_id, self.end_id)
            .with_skip(self.skip.clone())
            .with_batch_size(self.batch_size)
            .with_parallelism(self.parallelism)
            .with_id_retries(self.id_retries)
            .with_stop_on_error(self.stop_on_error)
            .with_overwrite(self.overwrite)
            .with_refiner(refiner);
        config.venv = self.venv.clone();
        config.python = self.python.clone();
        config.env_file = Some(self.env_file.clone());
        config
    }
}

/// Arguments for `refine-harness eval`.
#[derive(Parser, Debug)]
pub struct EvalArgs {
    /// Directory containing generated model subdirectories.
    #[arg(long, default_value = DEFAULT_OUTPUT_ROOT)]
    pub generated_root: PathBuf,

    /// Directory containing reference subdirectories (defaults to --generated-root).
    #[arg(long)]
    pub reference_root: Option<PathBuf>,

    /// Precision prompt template.
    #[arg(long, default_value = "evaluation_scripts/Evaluation_Prompts/sysm-eval-p.txt")]
    pub precision_prompt: PathBuf,

    /// Recall prompt template.
    #[arg(long, default_value = "evaluation_scripts/Evaluation_Prompts/sysm-eval-r.txt")]
    pub recall_prompt: PathBuf,

    /// Judge model.
    #[arg(short = 'm', long, default_value = "gpt-4.1")]
    pub model: String,

    #[arg(long, default_value = "0.2")]
    pub temperature: f64,

    #[arg(long, default_value = "1")]
    pub start_id: u32,

    #[arg(long, default_value = "75")]
    pub end_id: u32,

    /// Model IDs to skip.
    #[arg(long, num_args = 0..)]
    pub skip: Vec<u32>,

    /// Record file suffix, e.g. `gpt41` in `12_recall_gpt41.json`.
    #[arg(long, default_value = "gpt41")]
    pub label: String,

    /// Render prompts and write records without calling the API.
    #[arg(long)]
    pub dry_run: bool,

    /// OpenAI-compatible API base URL.
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    /// API key (required unless --dry-run).
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Print the summary as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `refine-harness difficulty`.
#[derive(Parser, Debug)]
pub struct DifficultyArgs {
    /// SysMBench dataset.json.
    #[arg(long, default_value = "sysmbench_original_upstream/dataset/sysml/dataset.json")]
    pub dataset: PathBuf,

    /// Root containing per-ID evaluation records.
    #[arg(long, default_value = DEFAULT_OUTPUT_ROOT)]
    pub scores_root: PathBuf,

    /// Output JSON path (default: <scores-root parent>/analysis/difficult_result.json).
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Record file suffix used by `eval`.
    #[arg(long, default_value = "gpt41")]
    pub label: String,

    /// Print the metrics as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the selected command with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Refine(args) => run_refine_command(*args).await,
        Commands::Eval(args) => run_eval_command(args).await,
        Commands::Difficulty(args) => run_difficulty_command(args),
    }
}

#[derive(Debug, Serialize)]
struct SessionSummaryOutput<'a> {
    session_id: &'a str,
    manifest_path: &'a Path,
    total_selected: usize,
    #[serde(flatten)]
    counts: StatusCounts,
    stopped_on_error: bool,
}

async fn run_refine_command(args: RefineArgs) -> anyhow::Result<()> {
    let base = std::env::current_dir()?;
    let config = args.to_config().resolve_against(&base);
    config.validate()?;
    config.check_paths()?;

    let mut env = SubprocessEnv::from_process();
    if let Some(env_file) = &config.env_file {
        env = env.with_env_file(env_file)?;
    }

    let units = select_units(&config)?;
    let refiner = CommandRefiner::from_config(&config, env)?;
    let config = Arc::new(config);
    let runner = RetryingRunner::new(
        UnitRunner::new(config.clone(), Arc::new(refiner)),
        config.id_retries,
    );
    let mut writer = SessionManifestWriter::create(&config, units.len())?;

    info!(
        session_id = writer.session_id(),
        selected = units.len(),
        batch_size = config.batch_size,
        parallelism = config.parallelism,
        "Starting refinement session"
    );

    let scheduler = BatchScheduler::from_config(&config, runner);
    let outcome = scheduler.run(&units, &mut writer).await;
    let stopped = matches!(outcome, Err(SchedulerError::StoppedOnError { .. }));
    if let Err(e) = &outcome {
        if !stopped {
            anyhow::bail!("{e}");
        }
    }

    let counts = writer.counts();
    let manifest_path = writer.manifest_path();
    if args.json {
        let summary = SessionSummaryOutput {
            session_id: writer.session_id(),
            manifest_path: &manifest_path,
            total_selected: units.len(),
            counts,
            stopped_on_error: stopped,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("\n=== Refinement Session {} ===", writer.session_id());
        println!("Selected:  {}", units.len());
        println!("OK:        {}", counts.ok);
        println!("Failed:    {}", counts.failed);
        println!("Skipped:   {}", counts.skipped);
        println!("Manifest:  {}", manifest_path.display());
    }

    match outcome {
        Ok(_) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Serialize)]
struct EvalSummaryOutput<'a> {
    evaluated: usize,
    skipped: usize,
    failed: usize,
    records: &'a [PathBuf],
    dry_run: bool,
}

async fn run_eval_command(args: EvalArgs) -> anyhow::Result<()> {
    let base = std::env::current_dir()?;
    let generated_root = base.join(&args.generated_root);
    let config = EvalConfig {
        reference_root: args
            .reference_root
            .as_ref()
            .map(|p| base.join(p))
            .unwrap_or_else(|| generated_root.clone()),
        generated_root,
        precision_prompt: base.join(&args.precision_prompt),
        recall_prompt: base.join(&args.recall_prompt),
        model: args.model.clone(),
        temperature: args.temperature,
        start_id: args.start_id,
        end_id: args.end_id,
        skip: args.skip.clone(),
        label: args.label.clone(),
        dry_run: args.dry_run,
    };

    let client = if args.dry_run {
        None
    } else {
        let api_key = args.api_key.clone().ok_or(LlmError::MissingApiKey)?;
        Some(ChatClient::new(&args.api_base, api_key)?)
    };
    let provider = client.as_ref().map(|c| c as &dyn LlmProvider);

    info!(
        model = %config.model,
        start_id = config.start_id,
        end_id = config.end_id,
        dry_run = config.dry_run,
        "Starting evaluation"
    );
    let summary = run_evaluation(&config, provider).await?;

    if args.json {
        let output = EvalSummaryOutput {
            evaluated: summary.evaluated,
            skipped: summary.skipped,
            failed: summary.failed,
            records: &summary.records,
            dry_run: config.dry_run,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("\n=== Evaluation Results ===");
        println!("Evaluated: {}", summary.evaluated);
        println!("Skipped:   {}", summary.skipped);
        println!("Failed:    {}", summary.failed);
        println!("Records:   {}", summary.records.len());
    }
    Ok(())
}

fn run_difficulty_command(args: DifficultyArgs) -> anyhow::Result<()> {
    let base = std::env::current_dir()?;
    let dataset = base.join(&args.dataset);
    let scores_root = base.join(&args.scores_root);
    let output = args.output.as_ref().map(|p| base.join(p));

    let report = run_difficulty(&dataset, &scores_root, &args.label, output.as_deref())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.metrics)?);
    } else {
        println!("\n=== Difficulty Distribution ===");
        for (bucket, count) in &report.distribution {
            println!("{bucket}:{count}");
        }
        for (bucket, m) in &report.metrics {
            println!(
                "  bucket {} precision={:.3} recall={:.3} n={}",
                bucket, m.precision, m.recall, m.count
            );
        }
        println!(
            "Difficulty metrics saved to {} (from {})",
            report.output_path.display(),
            scores_root.display()
        );
    }
    Ok(())
}
