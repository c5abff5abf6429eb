//! `tasksync` -- command-line client for the offline task store.
//!
//! Every command works offline: mutations land in the local database at
//! once and are queued for the task server when it cannot be reached.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/tasksync/config.toml`).
//!
//! ```bash
//! # Offline: everything is queued
//! tasksync add "Write report" --due 2026-11-01
//!
//! # Against a task server
//! tasksync --remote-url ws://127.0.0.1:9100/ws --user alice sync
//!
//! # Keep syncing every 30 s until Ctrl-C
//! tasksync --remote-url ws://127.0.0.1:9100/ws --user alice run
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;

use tasksync::config::{CliArgs, ClientConfig, ConfigError};
use tasksync::engine::SyncEngine;
use tasksync::events::ChangeEvent;
use tasksync::remote::ws::WsRemote;
use tasksync::remote::{InMemoryRemote, RemoteBackend, RemoteError};
use tasksync::repo::{NewTask, RemoteOutcome, RepoError};
use tasksync::store::{InMemoryStore, LocalStore, SqliteStore, StoreError};
use tasksync::sync::DrainReport;
use tasksync_proto::task::{Task, TaskId, TaskPatch, Timestamp};

#[derive(Parser, Debug)]
#[command(version, about = "Offline-first task list with background sync")]
struct Cli {
    #[command(flatten)]
    args: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a task.
    Add {
        /// Task title.
        title: String,
        /// Longer description.
        #[arg(short, long)]
        description: Option<String>,
        /// Due date (`YYYY-MM-DD` or RFC 3339).
        #[arg(long, value_parser = parse_due)]
        due: Option<Timestamp>,
        /// Use this id instead of a generated one.
        #[arg(long)]
        id: Option<String>,
    },
    /// Change fields of a task.
    Update {
        /// Task id.
        id: String,
        /// New title.
        #[arg(long)]
        title: Option<String>,
        /// New description.
        #[arg(long, conflicts_with = "clear_description")]
        description: Option<String>,
        /// Remove the description.
        #[arg(long)]
        clear_description: bool,
        /// New due date (`YYYY-MM-DD` or RFC 3339).
        #[arg(long, value_parser = parse_due, conflicts_with = "clear_due")]
        due: Option<Timestamp>,
        /// Remove the due date.
        #[arg(long)]
        clear_due: bool,
    },
    /// Mark a task as done.
    Complete {
        /// Task id.
        id: String,
        /// Mark as not done instead.
        #[arg(long)]
        undo: bool,
    },
    /// Delete a task.
    Delete {
        /// Task id.
        id: String,
    },
    /// List local tasks, newest first.
    List,
    /// Show changes waiting to reach the server.
    Pending,
    /// Replay pending changes now.
    Sync,
    /// Sync at startup and periodically until Ctrl-C.
    Run,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("{0}")]
    Usage(String),
    #[error("cannot write output: {0}")]
    Output(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli.args.log_level, cli.args.log_file.as_deref());

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging to stderr, or to `file_path` when given.
///
/// Returns a [`WorkerGuard`] for the file writer that must be held until
/// shutdown to ensure all buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some(path) = file_path else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .init();
        return None;
    };

    let log_dir = path.parent().filter(|d| !d.as_os_str().is_empty());
    let file_name = path.file_name()?.to_str()?;
    let file_appender =
        tracing_appender::rolling::never(log_dir.unwrap_or_else(|| Path::new(".")), file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let config = ClientConfig::load(&cli.args)?;
    let json = cli.args.json;
    let settings = config.engine_settings();

    if config.ephemeral {
        let remote = InMemoryRemote::new();
        if let Some(user) = &config.user_id {
            remote.sign_in(user.clone());
        }
        let engine = SyncEngine::new(Arc::new(InMemoryStore::new()), Arc::new(remote), settings)?;
        let result = execute(&engine, cli.command, &config, json).await;
        engine.shutdown().await;
        return result;
    }

    let store = Arc::new(SqliteStore::open(&config.store_path)?);
    tracing::info!(path = %config.store_path.display(), "task database ready");

    let result = if let Some(ws) = config.ws_remote_config() {
        let engine = SyncEngine::new(Arc::clone(&store), Arc::new(WsRemote::new(ws)?), settings)?;
        let result = execute(&engine, cli.command, &config, json).await;
        engine.shutdown().await;
        result
    } else {
        // No server configured: a signed-out remote keeps every write queued.
        tracing::info!("no remote configured, working offline");
        let engine = SyncEngine::new(Arc::clone(&store), Arc::new(InMemoryRemote::new()), settings)?;
        let result = execute(&engine, cli.command, &config, json).await;
        engine.shutdown().await;
        result
    };

    store.close()?;
    result
}

async fn execute<S, R>(
    engine: &SyncEngine<S, R>,
    command: Command,
    config: &ClientConfig,
    json: bool,
) -> Result<(), CliError>
where
    S: LocalStore + 'static,
    R: RemoteBackend + 'static,
{
    let repo = engine.repo();
    match command {
        Command::Add {
            title,
            description,
            due,
            id,
        } => {
            let input = NewTask {
                id: id.map(TaskId::new),
                title,
                description,
                due_date: due,
                is_completed: false,
            };
            let (id, outcome) = repo.add_task(input)?.settle().await?;
            print_mutation(&id, &outcome, json)?;
        }
        Command::Update {
            id,
            title,
            description,
            clear_description,
            due,
            clear_due,
        } => {
            let patch = TaskPatch {
                title,
                description: if clear_description {
                    Some(None)
                } else {
                    description.map(Some)
                },
                is_completed: None,
                due_date: if clear_due { Some(None) } else { due.map(Some) },
            };
            if patch.is_empty() {
                return Err(CliError::Usage("nothing to update".to_string()));
            }
            let (task, outcome) = repo.update_task(&TaskId::new(id), patch)?.settle().await?;
            print_mutation(&task.id, &outcome, json)?;
        }
        Command::Complete { id, undo } => {
            let (task, outcome) = repo.set_completed(&TaskId::new(id), !undo)?.settle().await?;
            print_mutation(&task.id, &outcome, json)?;
        }
        Command::Delete { id } => {
            let id = TaskId::new(id);
            let (existed, outcome) = repo.delete_task(&id)?.settle().await?;
            if !existed && !json {
                eprintln!("note: {id} was not stored locally");
            }
            print_mutation(&id, &outcome, json)?;
        }
        Command::List => {
            let tasks = repo.list_tasks()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else if tasks.is_empty() {
                println!("no tasks");
            } else {
                for task in &tasks {
                    println!("{}", format_task(task));
                }
            }
        }
        Command::Pending => {
            let changes = engine.store().pending_changes_ordered()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&changes)?);
            } else if changes.is_empty() {
                println!("nothing pending");
            } else {
                for change in &changes {
                    let error = change
                        .last_error
                        .as_deref()
                        .map(|e| format!("  last error: {e}"))
                        .unwrap_or_default();
                    println!(
                        "{}  {:<6}  {}  {}  attempts={}{}",
                        format_time(change.timestamp),
                        change.op.kind(),
                        change.task_id,
                        change.id,
                        change.attempts,
                        error
                    );
                }
            }
        }
        Command::Sync => {
            let report = engine.processor().process_until_idle().await?;
            print_report(&report, json)?;
        }
        Command::Run => run_loop(engine, config).await?,
    }
    Ok(())
}

/// Runs the periodic sync loop until Ctrl-C, logging change events.
async fn run_loop<S, R>(engine: &SyncEngine<S, R>, config: &ClientConfig) -> Result<(), CliError>
where
    S: LocalStore + 'static,
    R: RemoteBackend + 'static,
{
    let mut events = engine.repo().subscribe();
    let handle = engine.spawn_sync(config.sync_interval);
    println!(
        "syncing every {}s, press Ctrl-C to stop",
        config.sync_interval.as_secs()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ChangeEvent::DrainFinished { outcome, remaining }) => {
                    tracing::info!(?outcome, remaining, "drain finished");
                }
                Ok(ChangeEvent::ChangeReplayed { change_id, task_id }) => {
                    println!("synced {task_id} ({change_id})");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown().await;
    Ok(())
}

fn print_mutation(id: &TaskId, outcome: &RemoteOutcome, json: bool) -> Result<(), CliError> {
    let (remote, change) = match outcome {
        RemoteOutcome::Synced => ("synced", None),
        RemoteOutcome::Queued(change) => ("queued", Some(change.to_string())),
    };
    if json {
        let value = serde_json::json!({ "id": id, "remote": remote, "change_id": change });
        println!("{}", serde_json::to_string(&value)?);
    } else {
        println!("{id} ({remote})");
    }
    Ok(())
}

fn print_report(report: &DrainReport, json: bool) -> Result<(), CliError> {
    if json {
        let value = serde_json::json!({
            "outcome": format!("{:?}", report.outcome),
            "applied": report.applied,
            "remaining": report.remaining,
        });
        println!("{}", serde_json::to_string(&value)?);
    } else {
        println!(
            "{:?}: {} applied, {} remaining",
            report.outcome, report.applied, report.remaining
        );
    }
    Ok(())
}

fn format_task(task: &Task) -> String {
    let mark = if task.is_completed { "x" } else { " " };
    let due = task
        .due_date
        .map(|d| format!("  due {}", format_time(d)))
        .unwrap_or_default();
    let owner = if task.user_id.is_unclaimed() {
        String::new()
    } else {
        format!("  @{}", task.user_id)
    };
    format!("[{mark}] {}  {}{due}{owner}", task.id, task.title)
}

fn format_time(ts: Timestamp) -> String {
    i64::try_from(ts.as_millis())
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .map_or_else(
            || ts.to_string(),
            |dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
        )
}

fn parse_due(s: &str) -> Result<Timestamp, String> {
    let millis = if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        dt.timestamp_millis()
    } else {
        let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| format!("expected YYYY-MM-DD or RFC 3339: {e}"))?;
        date.and_hms_opt(0, 0, 0)
            .ok_or_else(|| "invalid date".to_string())?
            .and_utc()
            .timestamp_millis()
    };
    u64::try_from(millis)
        .map(Timestamp::from_millis)
        .map_err(|_| "dates before 1970 are not supported".to_string())
}
