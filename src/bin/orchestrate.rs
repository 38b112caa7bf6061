//! `orchestrate` — thin CLI surface over `orchestrator_core::Engine`.
//!
//! A `clap`-derived binary: `dotenvy::dotenv()` before parsing, then
//! `tracing_subscriber::fmt()` to wire up logging.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use orchestrator_core::{Engine, EngineConfig, MockPlanner};

#[derive(Parser)]
#[command(name = "orchestrate", about = "Decompose, route, and execute a free-form request across model providers")]
struct Cli {
    /// The request to decompose and execute. Omitted when a subcommand is given.
    prompt: Option<String>,

    /// Stream intermediate events to stdout as they occur instead of
    /// waiting for the final response.
    #[arg(long)]
    stream: bool,

    /// Overrides the configured global concurrency limit for this run.
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Overrides the configured planner model identifier.
    #[arg(long)]
    planner_model: Option<String>,

    /// Path to the engine configuration TOML file.
    #[arg(long, default_value = "configs/orchestrator.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print aggregate cost/latency statistics across every recorded run.
    Stats,
    /// List recent runs recorded in the journal.
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Replay a previously recorded run's trace and final output.
    Replay { run_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let mut config = EngineConfig::load_from_path(&cli.config)?;
    if let Some(max_concurrency) = cli.max_concurrency {
        config.max_concurrency = max_concurrency;
    }
    if let Some(planner_model) = cli.planner_model {
        config.planner.model = planner_model;
    }

    match cli.command {
        Some(Command::Stats) => {
            let stats = orchestrator_core::journal::aggregate_stats(&config.journal_dir)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            return Ok(());
        }
        Some(Command::History { limit }) => {
            let runs = orchestrator_core::journal::list_recent(&config.journal_dir, limit)?;
            for entry in runs {
                println!("{}  {}  tasks={}  cost=${:.4}", entry.run_id, entry.input_preview, entry.task_count, entry.total_cost);
            }
            return Ok(());
        }
        Some(Command::Replay { run_id }) => {
            let dir = std::path::Path::new(&config.journal_dir).join(format!("run_{run_id}"));
            let replayed = orchestrator_core::journal::replay(&dir)?;
            println!("input: {}", replayed.input);
            println!("tasks: {}", replayed.plan.tasks.len());
            println!("events recorded: {}", replayed.events.len());
            println!("output:\n{}", replayed.output);
            return Ok(());
        }
        None => {}
    }

    let Some(prompt) = cli.prompt else {
        anyhow::bail!("a prompt is required unless a subcommand is given");
    };

    let engine = Engine::new(config, Arc::new(MockPlanner))?;

    if cli.stream {
        use futures::StreamExt;
        let mut events = Box::pin(engine.run_streaming(prompt, None));
        while let Some(event) = events.next().await {
            println!("{}", serde_json::to_string(&event)?);
        }
    } else {
        let response = engine.run(&prompt, None).await?;
        println!("{}", response.output);
    }

    Ok(())
}
