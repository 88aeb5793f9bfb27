use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;
use waypoint_core::{load_config, HandlerRegistry, Pipeline, WaypointConfig, WorkerPool};
use waypoint_schema::{Actor, PlaceCandidate, TaskStatus};
use waypoint_server::state::AppState;
use waypoint_tasks::{NewTask, TaskFilter};

#[derive(Parser)]
#[command(name = "waypoint", version, about = "Itinerary mutation pipeline")]
struct Cli {
    #[arg(long, short = 'c', default_value = "waypoint.yaml", help = "Path to waypoint.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the worker pool and the HTTP API server")]
    Start {
        #[arg(long, help = "Override server.bind")]
        bind: Option<String>,
    },
    #[command(about = "Validate the config file")]
    Validate,
    #[command(subcommand, about = "Inspect and manage tasks")]
    Task(TaskCommands),
    #[command(subcommand, about = "Inspect itineraries")]
    Itinerary(ItineraryCommands),
    #[command(subcommand, about = "Inspect and resolve canonical places")]
    Place(PlaceCommands),
}

#[derive(Subcommand)]
enum TaskCommands {
    #[command(about = "List tasks")]
    List {
        #[arg(long, help = "pending, running, completed, failed or cancelled")]
        status: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    #[command(about = "Show one task as JSON")]
    Show { task_id: Uuid },
    #[command(about = "Submit a task from a JSON request")]
    Submit {
        #[arg(help = "NewTask JSON, or @path to read it from a file")]
        request: String,
    },
    #[command(about = "Cancel a task")]
    Cancel {
        task_id: Uuid,
        #[arg(long, default_value = "cancelled from cli")]
        reason: String,
    },
}

#[derive(Subcommand)]
enum ItineraryCommands {
    #[command(about = "List itineraries")]
    List,
    #[command(about = "Show one itinerary as JSON")]
    Show { itinerary_id: String },
    #[command(about = "Show revision history")]
    History { itinerary_id: String },
    #[command(about = "Undo a revision by applying its inverse")]
    Undo {
        itinerary_id: String,
        revision_id: Uuid,
    },
}

#[derive(Subcommand)]
enum PlaceCommands {
    #[command(about = "List recently updated places")]
    List {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    #[command(about = "Show one place as JSON")]
    Show { place_id: String },
    #[command(about = "Resolve a candidate from JSON")]
    Resolve {
        #[arg(help = "PlaceCandidate JSON, or @path to read it from a file")]
        candidate: String,
    },
    #[command(about = "Retry queued merges now")]
    RetryPending,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    match command {
        Commands::Validate => {
            let config = load_config(&cli.config)?;
            println!(
                "Config valid. data_dir={}, {} workers, server on {}.",
                config.data_dir.display(),
                config.workers.count,
                config.server.bind
            );
        }
        Commands::Start { bind } => {
            let (config, pipeline, _guard) = open_pipeline(&cli.config)?;
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            run_start(pipeline, &config, &bind).await?;
        }
        Commands::Task(cmd) => {
            let (_, pipeline, _guard) = open_pipeline(&cli.config)?;
            run_task_command(&pipeline, cmd).await?;
        }
        Commands::Itinerary(cmd) => {
            let (_, pipeline, _guard) = open_pipeline(&cli.config)?;
            run_itinerary_command(&pipeline, cmd).await?;
        }
        Commands::Place(cmd) => {
            let (_, pipeline, _guard) = open_pipeline(&cli.config)?;
            run_place_command(&pipeline, cmd).await?;
        }
    }
    Ok(())
}

fn open_pipeline(
    config_path: &Path,
) -> Result<(WaypointConfig, Arc<Pipeline>, tracing_appender::non_blocking::WorkerGuard)> {
    let config = read_config(config_path)?;
    let guard = init_logging(&config.log_dir())?;
    let pipeline = Pipeline::open(&config, HandlerRegistry::with_builtins())?;
    Ok((config, Arc::new(pipeline), guard))
}

/// Like `load_config`, but a missing file falls back to defaults.
fn read_config(path: &Path) -> Result<WaypointConfig> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(WaypointConfig::default())
    }
}

fn init_logging(log_dir: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log dir: {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "waypoint.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();
    Ok(guard)
}

async fn run_start(pipeline: Arc<Pipeline>, config: &WaypointConfig, bind: &str) -> Result<()> {
    let pool = WorkerPool::new(pipeline.clone(), config.workers.clone());
    let handles = pool.start();

    let shutdown = pool.shutdown_token();
    let signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
        }
        tracing::info!("shutting down");
        shutdown.cancel();
    };

    let served = waypoint_server::serve_until(AppState::new(pipeline), bind, signal).await;
    pool.shutdown();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!("worker task ended abnormally: {e}");
        }
    }
    served
}

/// Inline JSON, or `@path` to read from a file.
fn read_json_arg<T: serde::de::DeserializeOwned>(arg: &str) -> Result<T> {
    let raw = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {path}"))?,
        None => arg.to_string(),
    };
    serde_json::from_str(&raw).context("invalid JSON argument")
}

async fn run_task_command(pipeline: &Pipeline, cmd: TaskCommands) -> Result<()> {
    match cmd {
        TaskCommands::List { status, limit } => {
            let filter = TaskFilter {
                status: status.as_deref().map(str::parse::<TaskStatus>).transpose()?,
                limit: Some(limit),
                ..TaskFilter::default()
            };
            let tasks = pipeline.tasks().list(&filter).await?;
            if tasks.is_empty() {
                println!("No tasks.");
                return Ok(());
            }
            println!(
                "{:<38} {:<16} {:<10} {:<4} {:<9} {:<20}",
                "TASK ID", "TYPE", "STATUS", "PRI", "ATTEMPTS", "ITINERARY"
            );
            println!("{}", "-".repeat(100));
            for task in &tasks {
                println!(
                    "{:<38} {:<16} {:<10} {:<4} {:<9} {:<20}",
                    task.id.to_string(),
                    task.task_type.as_str(),
                    task.status().as_str(),
                    task.priority,
                    format!("{}/{}", task.attempts_taken(), task.retry_policy.max_attempts),
                    task.itinerary_id.as_deref().unwrap_or("-"),
                );
            }
        }
        TaskCommands::Show { task_id } => {
            let task = pipeline
                .tasks()
                .get(task_id)
                .await?
                .ok_or_else(|| anyhow!("task not found: {task_id}"))?;
            println!("Status: {}", task.status());
            if let Some(error) = task.last_error() {
                println!("Last error: {error}");
            }
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskCommands::Submit { request } => {
            let request: NewTask = read_json_arg(&request)?;
            let task_type = request.task_type;
            let receipt = pipeline.tasks().submit(request).await?;
            if receipt.deduplicated {
                println!("Existing {task_type} task {} ({})", receipt.task_id, receipt.status);
            } else {
                println!("Submitted {task_type} task {}", receipt.task_id);
            }
        }
        TaskCommands::Cancel { task_id, reason } => {
            pipeline.tasks().cancel(task_id, &reason).await?;
            println!("Task {task_id} cancelled.");
        }
    }
    Ok(())
}

async fn run_itinerary_command(pipeline: &Pipeline, cmd: ItineraryCommands) -> Result<()> {
    match cmd {
        ItineraryCommands::List => {
            let items = pipeline.revisions().list().await?;
            println!("{:<40} {:<8} {:<30}", "ITINERARY ID", "VERSION", "TITLE");
            println!("{}", "-".repeat(80));
            for item in &items {
                println!("{:<40} {:<8} {:<30}", item.id, item.version, item.title);
            }
        }
        ItineraryCommands::Show { itinerary_id } => {
            let doc = pipeline.revisions().get(&itinerary_id).await?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        ItineraryCommands::History { itinerary_id } => {
            let history = pipeline.revisions().history(&itinerary_id).await?;
            for record in &history {
                let reason = if record.reason.is_empty() {
                    "-"
                } else {
                    record.reason.as_str()
                };
                println!(
                    "v{} -> v{}  {}  {}  {}",
                    record.from_version, record.to_version, record.revision_id, record.actor, reason
                );
            }
        }
        ItineraryCommands::Undo {
            itinerary_id,
            revision_id,
        } => {
            let outcome = pipeline
                .revisions()
                .undo(&itinerary_id, revision_id, Actor::System)
                .await?;
            println!(
                "Undid {revision_id}: itinerary {itinerary_id} now at v{}",
                outcome.to_version
            );
        }
    }
    Ok(())
}

async fn run_place_command(pipeline: &Pipeline, cmd: PlaceCommands) -> Result<()> {
    match cmd {
        PlaceCommands::List { limit } => {
            let places = pipeline.places().list(limit).await?;
            println!("{:<24} {:<32} {:<8} {:<6}", "PLACE ID", "NAME", "SOURCES", "CONF");
            println!("{}", "-".repeat(75));
            for place in &places {
                println!(
                    "{:<24} {:<32} {:<8} {:<6.2}",
                    place.id,
                    place.name,
                    place.sources.len(),
                    place.confidence
                );
            }
        }
        PlaceCommands::Show { place_id } => {
            let place = pipeline.places().get(&place_id).await?;
            println!("{}", serde_json::to_string_pretty(&place)?);
        }
        PlaceCommands::Resolve { candidate } => {
            let candidate: PlaceCandidate = read_json_arg(&candidate)?;
            let outcome = pipeline.places().resolve(candidate).await?;
            println!(
                "{} {} ({})",
                if outcome.created { "Created" } else { "Merged into" },
                outcome.place_id,
                outcome.source_key
            );
        }
        PlaceCommands::RetryPending => {
            let report = pipeline.places().retry_pending().await?;
            println!(
                "{} merged, {} still pending, {} dropped.",
                report.merged, report.still_pending, report.dropped
            );
        }
    }
    Ok(())
}
