//! Babylon — recursive multi-agent coding orchestrator.
//!
//! One subcommand: `babylon run <description>`. Configuration precedence is
//! CLI flags > environment > `.babylonrc.json`.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use babylon_core::config::{generation_dirs, BabylonConfig, RendererKind};
use babylon_core::{Babylon, TaskStatus};

mod renderer;

#[derive(Parser)]
#[command(name = "babylon")]
#[command(about = "Recursive multi-agent coding orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a coding task against the working directory
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// What to do, in plain language
    description: String,

    /// LLM provider (openai | anthropic)
    #[arg(long)]
    provider: Option<String>,

    /// Model for all roles
    #[arg(long)]
    model: Option<String>,

    /// Renderer (terminal | log | none)
    #[arg(long)]
    renderer: Option<String>,

    /// Dollar budget; the run is cancelled when exceeded
    #[arg(long)]
    budget: Option<f64>,

    /// Maximum decomposition depth
    #[arg(long = "max-depth")]
    max_depth: Option<u32>,

    /// Disable the external coding-assistant CLI tool
    #[arg(long = "no-cli")]
    no_cli: bool,

    /// Working directory (default: current)
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Verbose logging
    #[arg(long)]
    verbose: bool,

    /// Model override for the reviewer role
    #[arg(long = "reviewer-model")]
    reviewer_model: Option<String>,

    /// Economy mode: fewer turns, cheaper reviewer
    #[arg(long)]
    economy: bool,

    /// Complexity at or below which the planner is skipped (0..1)
    #[arg(long = "complexity-threshold")]
    complexity_threshold: Option<f64>,

    /// Sliding-window size for agent conversations
    #[arg(long = "max-context-turns")]
    max_context_turns: Option<usize>,

    /// Named run: work in generations/<NN>-<name>/output
    #[arg(long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let Commands::Run(args) = cli.command;

    match run(args).await {
        Ok(status) if status == TaskStatus::Completed => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("babylon: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: RunArgs) -> Result<TaskStatus> {
    let base_dir = match &args.cwd {
        Some(cwd) => cwd
            .canonicalize()
            .with_context(|| format!("invalid --cwd {}", cwd.display()))?,
        None => std::env::current_dir().context("cannot resolve current directory")?,
    };

    // Named runs get a fresh generation directory and a run log.
    let (working_dir, run_log) = match &args.name {
        Some(name) => {
            let (output, log) = generation_dirs(&base_dir, name)
                .context("failed to prepare generation directory")?;
            (output, Some(log))
        }
        None => (base_dir, None),
    };

    let mut config = BabylonConfig::load(working_dir).context("failed to load configuration")?;
    apply_cli_overrides(&mut config, &args, run_log);
    init_logging(&config)?;

    let babylon = Babylon::new(config.clone())?;
    renderer::attach(config.renderer, babylon.bus());

    // Ctrl-C propagates into every running agent and tool call.
    let cancellation = babylon.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt received, cancelling run…");
            cancellation.cancel();
        }
    });

    let result = babylon.run(&args.description).await;

    println!();
    println!("Status:   {}", result.status);
    println!("Duration: {:.1}s", result.duration.as_secs_f64());
    println!(
        "Tokens:   {} ({} prompt / {} completion)",
        result.usage.total_tokens, result.usage.prompt_tokens, result.usage.completion_tokens
    );
    println!("Cost:     ${:.4}", result.cost.total);
    if let Some(reason) = result.failure_reason() {
        println!("Reason:   {}", first_line(reason));
    }

    Ok(result.status)
}

fn apply_cli_overrides(config: &mut BabylonConfig, args: &RunArgs, run_log: Option<PathBuf>) {
    if let Some(provider) = &args.provider {
        config.default_provider = Some(provider.clone());
    }
    if let Some(model) = &args.model {
        config.default_model = Some(model.clone());
    }
    if let Some(renderer) = &args.renderer {
        match renderer.parse::<RendererKind>() {
            Ok(kind) => config.renderer = kind,
            Err(e) => eprintln!("babylon: {e}, keeping default renderer"),
        }
    }
    if let Some(budget) = args.budget {
        config.budget_dollars = Some(budget);
    }
    if let Some(max_depth) = args.max_depth {
        config.max_depth = max_depth;
    }
    if args.no_cli {
        config.use_cli = false;
    }
    if args.verbose {
        config.verbose = true;
    }
    if let Some(model) = &args.reviewer_model {
        config.reviewer_model = Some(model.clone());
    }
    if args.economy {
        config.economy_mode = true;
    }
    if let Some(threshold) = args.complexity_threshold {
        config.complexity_direct_threshold = threshold.clamp(0.0, 1.0);
    }
    if let Some(turns) = args.max_context_turns {
        config.max_context_turns = Some(turns);
    }
    if let Some(log) = run_log {
        config.run_log_path = Some(log);
    }
}

fn init_logging(config: &BabylonConfig) -> Result<()> {
    let default_level = if config.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    match &config.run_log_path {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("cannot create run log {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}
