use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use scanflow::log::{self, LogLevel, Sink};
use scanflow::orchestration::{CommandAdapter, SchedulerEvent};
use scanflow::{slog, slog_warn, Engine, EngineConfig, Error, Result, Workflow};

/// Scanflow - dependency-ordered execution of security tool workflows
#[derive(Parser, Debug)]
#[command(name = "scanflow")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    SCANFLOW_DEBUG=1        Enable debug logging (alternative to --debug)\n    SCANFLOW_LOG=<level>    Set the log level explicitly"
)]
pub struct Cli {
    /// Engine config file (default: ~/.scanflow/scanflow.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging (writes to ~/.scanflow/scanflow.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a workflow file and print the outcome as JSON
    Run {
        /// Workflow definition (TOML)
        workflow: PathBuf,

        /// Target for every task that does not declare one
        #[arg(long)]
        target: Option<String>,

        /// Override the process pool size
        #[arg(long)]
        max_concurrent: Option<usize>,
    },

    /// Check a workflow file and print its execution layers
    Validate {
        /// Workflow definition (TOML)
        workflow: PathBuf,
    },

    /// List registered tools and whether their binaries are available
    Tools {
        /// Only show tools of this category
        #[arg(long)]
        category: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };
    init_logging(&config, cli.debug)?;

    match cli.command {
        Command::Run {
            workflow,
            target,
            max_concurrent,
        } => {
            if let Some(n) = max_concurrent {
                config.max_concurrent = n;
            }
            let success = run_workflow(&workflow, target.as_deref(), config)?;
            if !success {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Validate { workflow } => run_validate(&workflow, config),
        Command::Tools { category } => run_tools(category.as_deref(), config),
    }
}

fn init_logging(config: &EngineConfig, debug: bool) -> Result<()> {
    let level = log::effective_level(config.level()?, debug);
    let sink = match config.log_path() {
        Some(path) => Sink::File(path),
        None => Sink::Stderr,
    };
    log::init(sink, level);
    if level >= LogLevel::Debug {
        slog!("Scanflow starting (debug mode enabled)");
    }
    Ok(())
}

/// Engine with the built-in adapters registered.
fn build_engine(config: EngineConfig) -> Result<Engine> {
    let mut engine = Engine::new(config)?;
    engine.register_adapter(Arc::new(CommandAdapter::new()))?;
    Ok(engine)
}

fn load_workflow(path: &Path, target: Option<&str>) -> Result<Workflow> {
    let workflow = Workflow::from_file(path)?;
    Ok(match target {
        Some(target) => workflow.with_default_target(target),
        None => workflow,
    })
}

/// Run a workflow with progress on stderr. Returns whether it succeeded.
fn run_workflow(path: &Path, target: Option<&str>, config: EngineConfig) -> Result<bool> {
    let workflow = load_workflow(path, target)?;
    let engine = build_engine(config)?;
    let rt = tokio::runtime::Runtime::new()?;

    let outcome = rt.block_on(async {
        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                slog_warn!("Interrupted, cancelling workflow");
                eprintln!("Interrupted, stopping running tools...");
                on_interrupt.cancel();
            }
        });

        let (tx, rx) = mpsc::channel(64);
        let printer = tokio::spawn(print_progress(rx));
        let outcome = engine.execute(&workflow, &cancel, Some(tx)).await;
        let _ = printer.await;
        outcome
    })?;

    println!("{}", outcome.to_json_pretty()?);
    Ok(outcome.is_success())
}

async fn print_progress(mut rx: mpsc::Receiver<SchedulerEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            SchedulerEvent::LayerStarted { layer, tasks } => {
                eprintln!("[layer {}] {}", layer, tasks.join(", "));
            }
            SchedulerEvent::TaskStarted { task_id, tool } => {
                eprintln!("  > {} ({})", task_id, tool);
            }
            SchedulerEvent::TaskCompleted { task_id, duration } => {
                eprintln!("  ok {} ({:.2}s)", task_id, duration.as_secs_f64());
            }
            SchedulerEvent::TaskFailed { task_id, error } => {
                eprintln!("  FAILED {}: {}", task_id, error);
            }
            SchedulerEvent::TaskSkipped { task_id, reason } => {
                eprintln!("  skipped {}: {}", task_id, reason);
            }
            SchedulerEvent::WorkflowComplete { stats, cancelled } => {
                eprintln!(
                    "{} tasks: {} completed, {} failed, {} skipped, {} not run{}",
                    stats.total,
                    stats.completed,
                    stats.failed,
                    stats.skipped,
                    stats.pending,
                    if cancelled { " (cancelled)" } else { "" }
                );
            }
        }
    }
}

fn run_validate(path: &Path, config: EngineConfig) -> Result<()> {
    let workflow = load_workflow(path, None)?;
    let engine = build_engine(config)?;
    let graph = engine.build_graph(&workflow)?;

    let output = serde_json::json!({
        "workflow": workflow.name,
        "tasks": graph.task_count(),
        "dependencies": graph.edge_count(),
        "layers": graph.layers(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_tools(category: Option<&str>, config: EngineConfig) -> Result<()> {
    let engine = build_engine(config)?;
    let registry = engine.registry();
    let availability = registry.validate_dependencies();

    let tools: Vec<serde_json::Value> = registry
        .list(category)
        .into_iter()
        .filter_map(|name| registry.tool_info(name))
        .map(|info| {
            let available = availability.get(&info.name).copied().unwrap_or(false);
            serde_json::json!({
                "name": info.name,
                "category": info.category,
                "description": info.description,
                "required_binaries": info.required_binaries,
                "available": available,
            })
        })
        .collect();

    if tools.is_empty() {
        if let Some(category) = category {
            return Err(Error::Config(format!("No tools in category '{}'", category)));
        }
    }
    println!("{}", serde_json::to_string_pretty(&tools)?);
    Ok(())
}
