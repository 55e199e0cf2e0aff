//! CLI command definitions for trial-forge.
//!
//! Every command works on a runs directory. `run` and `resume` execute
//! trials; `add-models`, `requeue` and `status` only touch run state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::controller::{ControllerOptions, NewRun, RunController, RunSummary};
use crate::llm::{ModelRouter, OpenAiCompatProvider, ProviderRoute, DEFAULT_API_BASE};
use crate::pipeline::{EngineConfig, ExperimentDefinition};
use crate::types::EvaluationStrategy;

/// Resumable multi-model trial orchestration.
#[derive(Parser)]
#[command(name = "trial-forge")]
#[command(about = "Run scenario x framework x model trials through a three-stage LLM pipeline")]
#[command(version)]
#[command(
    long_about = "trial-forge runs every scenario x framework x model combination of an experiment file through context, generation and evaluation stages, persisting each step so an interrupted run resumes exactly where it stopped.\n\nExample usage:\n  trial-forge run --experiment experiment.yaml\n  trial-forge resume\n  trial-forge add-models --models vendor/new-model\n  trial-forge status"
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
    /// Start a run from an experiment file, or continue the active one.
    Run(RunArgs),

    /// Resume a run by id, or the active run.
    Resume(ResumeArgs),

    /// Add models to a run; their trials continue the id sequence.
    AddModels(AddModelsArgs),

    /// Move failed trials back to pending.
    Requeue(RequeueArgs),

    /// Show a run's registry summary without executing anything.
    Status(StatusArgs),
}

/// Engine settings shared by executing commands. Flags override
/// `TRIAL_FORGE_*` environment variables, which override defaults.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct EngineArgs {
    /// Directory holding all runs.
    #[arg(long)]
    pub runs_dir: Option<PathBuf>,

    /// Maximum trials per model in one batch.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Seconds to pause between batches.
    #[arg(long)]
    pub batch_delay_secs: Option<u64>,

    /// Maximum trials executing at once within a batch.
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Hard timeout per provider call, in seconds.
    #[arg(long)]
    pub call_timeout_secs: Option<u64>,

    /// Provider API key.
    #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// OpenAI-compatible API base URL.
    #[arg(long, env = "LLM_API_BASE")]
    pub api_base: Option<String>,

    /// Extra gateway as PATTERN=BASE_URL[,KEY_ENV]; a PATTERN ending in `/`
    /// is a model-id prefix. Repeatable; adds to TRIAL_FORGE_ROUTES.
    #[arg(long = "route")]
    pub routes: Vec<String>,
}

/// Session controls shared by `run` and `resume`.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct SessionArgs {
    /// Stop cleanly after this many batches; the run stays resumable.
    #[arg(long)]
    pub max_batches: Option<usize>,

    /// Remove a lock left behind by a process that no longer exists.
    #[arg(long)]
    pub force_unlock: bool,

    /// Seconds between progress log lines.
    #[arg(long, default_value = "30")]
    pub progress_secs: u64,

    /// Print the final summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `trial-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Experiment file (YAML, or JSON by extension).
    #[arg(short = 'e', long)]
    pub experiment: PathBuf,

    /// Always create a new run, even if one is active.
    #[arg(long)]
    pub fresh: bool,

    /// Comma-separated scenario ids to include.
    #[arg(long, value_delimiter = ',')]
    pub scenarios: Vec<String>,

    /// Comma-separated framework ids to include.
    #[arg(long, value_delimiter = ',')]
    pub frameworks: Vec<String>,

    /// Comma-separated model ids to include. On an active run, only limits
    /// which pending trials are scheduled.
    #[arg(long, value_delimiter = ',')]
    pub models: Vec<String>,

    /// Evaluation rubric: holistic, dimensional or calibrated.
    #[arg(long)]
    pub strategy: Option<String>,

    #[command(flatten)]
    pub session: SessionArgs,

    #[command(flatten)]
    pub engine: EngineArgs,
}

/// Arguments for `trial-forge resume`.
#[derive(Parser, Debug)]
pub struct ResumeArgs {
    /// Run to resume; defaults to the active run.
    #[arg(long)]
    pub run_id: Option<String>,

    /// Comma-separated model ids; only their pending trials are scheduled.
    #[arg(long, value_delimiter = ',')]
    pub models: Vec<String>,

    #[command(flatten)]
    pub session: SessionArgs,

    #[command(flatten)]
    pub engine: EngineArgs,
}

/// Arguments for `trial-forge add-models`.
#[derive(Parser, Debug)]
pub struct AddModelsArgs {
    /// Comma-separated model ids to add.
    #[arg(long, value_delimiter = ',', required = true)]
    pub models: Vec<String>,

    /// Run to extend; defaults to the active run.
    #[arg(long)]
    pub run_id: Option<String>,

    /// Directory holding all runs.
    #[arg(long)]
    pub runs_dir: Option<PathBuf>,

    /// Remove a lock left behind by a process that no longer exists.
    #[arg(long)]
    pub force_unlock: bool,
}

/// Arguments for `trial-forge requeue`.
#[derive(Parser, Debug)]
pub struct RequeueArgs {
    /// Comma-separated trial ids; all failed trials when omitted.
    #[arg(long, value_delimiter = ',')]
    pub trials: Vec<String>,

    /// Run to modify; defaults to the active run.
    #[arg(long)]
    pub run_id: Option<String>,

    /// Directory holding all runs.
    #[arg(long)]
    pub runs_dir: Option<PathBuf>,

    /// Remove a lock left behind by a process that no longer exists.
    #[arg(long)]
    pub force_unlock: bool,
}

/// Arguments for `trial-forge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Run to inspect; defaults to the active run.
    #[arg(long)]
    pub run_id: Option<String>,

    /// Directory holding all runs.
    #[arg(long)]
    pub runs_dir: Option<PathBuf>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses arguments and runs the command.
pub async fn run() -> anyhow::Result<i32> {
    run_with_cli(parse_cli()).await
}

/// Runs the command, returning the process exit code.
///
/// Errors mean the command could not start (exit code 1 at the binary).
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Run(args) => run_run_command(args).await,
        Commands::Resume(args) => run_resume_command(args).await,
        Commands::AddModels(args) => run_add_models_command(args),
        Commands::Requeue(args) => run_requeue_command(args),
        Commands::Status(args) => run_status_command(args),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Flags given to `run` that only shape a newly created run.
fn creation_only_flags(args: &RunArgs) -> Vec<&'static str> {
    let mut flags = Vec::new();
    if !args.scenarios.is_empty() {
        flags.push("--scenarios");
    }
    if !args.frameworks.is_empty() {
        flags.push("--frameworks");
    }
    if args.strategy.is_some() {
        flags.push("--strategy");
    }
    flags
}

async fn run_run_command(args: RunArgs) -> anyhow::Result<i32> {
    let (controller, router) =
        build_controller(&args.engine, &args.session, non_empty(&args.models))?;

    if !args.fresh {
        if let Some(active) = controller.store().pointer().current()? {
            info!(run_id = %active, "Continuing active run (pass --fresh to start a new one)");
            let ignored = creation_only_flags(&args);
            if !ignored.is_empty() {
                warn!(
                    run_id = %active,
                    flags = %ignored.join(", "),
                    "These flags only apply when creating a run; ignoring"
                );
            }
            let summary = controller.resume(Some(&active)).await?;
            return report(&summary, args.session.json);
        }
    }

    let (definition, digest) = ExperimentDefinition::load(&args.experiment)
        .with_context(|| format!("Failed to load experiment file {:?}", args.experiment))?;
    let definition = definition.filtered(
        non_empty(&args.scenarios),
        non_empty(&args.frameworks),
        non_empty(&args.models),
    )?;
    let unroutable: Vec<String> = definition
        .all_models()
        .into_iter()
        .filter(|model| !router.can_route(model))
        .collect();
    if !unroutable.is_empty() {
        anyhow::bail!("No provider route for model(s): {}", unroutable.join(", "));
    }
    let strategy = args
        .strategy
        .as_deref()
        .map(str::parse::<EvaluationStrategy>)
        .transpose()
        .map_err(anyhow::Error::msg)?;

    let summary = controller
        .start(NewRun {
            definition,
            digest: Some(digest),
            strategy,
            start_command: std::env::args().collect::<Vec<_>>().join(" "),
        })
        .await?;
    report(&summary, args.session.json)
}

async fn run_resume_command(args: ResumeArgs) -> anyhow::Result<i32> {
    let (controller, _) = build_controller(&args.engine, &args.session, non_empty(&args.models))?;
    let summary = controller.resume(args.run_id.as_deref()).await?;
    report(&summary, args.session.json)
}

fn run_add_models_command(args: AddModelsArgs) -> anyhow::Result<i32> {
    let controller = state_controller(args.runs_dir)?.with_force_unlock(args.force_unlock);
    let (run, added) = controller.add_models(args.run_id.as_deref(), &args.models)?;

    if added.is_empty() {
        println!("No new trials: every model is already part of {}", run.run_id());
    } else {
        println!(
            "Added {} trials to {} ({} .. {})",
            added.len(),
            run.run_id(),
            added[0].trial_id,
            added[added.len() - 1].trial_id
        );
        println!("Run `trial-forge resume --run-id {}` to execute them.", run.run_id());
    }
    Ok(0)
}

fn run_requeue_command(args: RequeueArgs) -> anyhow::Result<i32> {
    let controller = state_controller(args.runs_dir)?.with_force_unlock(args.force_unlock);
    let (run, requeued) = controller.requeue(args.run_id.as_deref(), non_empty(&args.trials))?;

    if requeued.is_empty() {
        println!("No failed trials in {}", run.run_id());
    } else {
        println!("Requeued {} trials in {}:", requeued.len(), run.run_id());
        for id in &requeued {
            println!("  {}", id);
        }
    }
    Ok(0)
}

fn run_status_command(args: StatusArgs) -> anyhow::Result<i32> {
    let controller = state_controller(args.runs_dir)?;
    let summary = controller.status(args.run_id.as_deref())?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary.render());
    }
    Ok(0)
}

// ============================================================================
// Helpers
// ============================================================================

fn report(summary: &RunSummary, json: bool) -> anyhow::Result<i32> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        print!("{}", summary.render());
    }
    Ok(summary.exit_code())
}

fn non_empty(values: &[String]) -> Option<&[String]> {
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

fn engine_config(args: &EngineArgs) -> anyhow::Result<EngineConfig> {
    let mut config = EngineConfig::from_env()?;
    if let Some(dir) = &args.runs_dir {
        config = config.with_runs_dir(dir.clone());
    }
    if let Some(size) = args.batch_size {
        config = config.with_batch_size_per_model(size);
    }
    if let Some(secs) = args.batch_delay_secs {
        config = config.with_inter_batch_delay(Duration::from_secs(secs));
    }
    if let Some(max) = args.max_concurrent {
        config = config.with_max_concurrent_trials(max);
    }
    if let Some(secs) = args.call_timeout_secs {
        config = config.with_call_timeout(Duration::from_secs(secs));
    }
    for route in &args.routes {
        let route: ProviderRoute = route
            .parse()
            .map_err(|e: String| anyhow::anyhow!("Invalid --route: {}", e))?;
        config = config.with_route(route);
    }
    config.validate()?;
    Ok(config)
}

/// The default gateway plus every configured route.
fn build_router(args: &EngineArgs, config: &EngineConfig) -> anyhow::Result<ModelRouter> {
    let gateway = match &args.api_key {
        Some(key) => OpenAiCompatProvider::with_timeout(
            key.clone(),
            args.api_base.clone().unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            config.call_timeout,
        )?,
        None => OpenAiCompatProvider::from_env(config.call_timeout).map_err(|e| {
            anyhow::anyhow!(
                "Failed to initialize LLM client: {}. Please provide --api-key or set LLM_API_KEY/OPENROUTER_API_KEY.",
                e
            )
        })?,
    };
    info!(
        api_base = %gateway.base_url(),
        api_key = %gateway.api_key_masked(),
        "Using OpenAI-compatible gateway"
    );

    let default_key = args
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENROUTER_API_KEY").ok());
    let mut router = ModelRouter::single(Arc::new(gateway));
    for route in &config.routes {
        let provider =
            OpenAiCompatProvider::for_route(route, default_key.as_deref(), config.call_timeout)
                .with_context(|| format!("Failed to configure route '{}'", route.pattern))?;
        info!(
            pattern = %route.pattern,
            api_base = %provider.base_url(),
            "Using routed gateway"
        );
        router = router.with_route(route, Arc::new(provider));
    }
    Ok(router)
}

fn build_controller(
    engine: &EngineArgs,
    session: &SessionArgs,
    models: Option<&[String]>,
) -> anyhow::Result<(RunController, ModelRouter)> {
    let config = engine_config(engine)?;
    let router = build_router(engine, &config)?;
    let options = ControllerOptions {
        max_batches: session.max_batches,
        force_unlock: session.force_unlock,
        model_filter: models.map(<[String]>::to_vec),
        progress_interval: Duration::from_secs(session.progress_secs.max(1)),
    };
    let controller =
        RunController::new(config, Arc::new(router.clone())).with_options(options);
    Ok((controller, router))
}

/// Controller for commands that never call a provider.
fn state_controller(runs_dir: Option<PathBuf>) -> anyhow::Result<RunController> {
    let mut config = EngineConfig::from_env()?;
    if let Some(dir) = runs_dir {
        config = config.with_runs_dir(dir);
    }
    Ok(RunController::new(config, Arc::new(ModelRouter::new())))
}
