//! `spool`: control panel and demo worker for a spool database.
//!
//! ```text
//! spool enqueue echo --params '{"msg":"hi"}' --priority 5
//! spool work --strategy priority --max-iterations 100
//! spool list --status failed
//! ```

mod handlers;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use spool_core::app::{Reaper, StopHandle, WorkerBuilder};
use spool_core::config::SpoolConfig;
use spool_core::domain::{NewTask, Task, TaskId, WorkerId};
use spool_core::impls::init_reporter;
use spool_core::observability::stale_workers;
use spool_core::ports::TaskStore;
use spool_core::queue::{ClaimStrategy, SqliteTaskStore, TaskStatus};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "spool")]
#[command(about = "Persisted task queue with competing workers", long_about = None)]
struct Cli {
    /// YAML config file
    #[arg(long, global = true, env = "SPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Database file (overrides config and SPOOL_DATABASE)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Default log filter; RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a task to the queue
    Enqueue {
        task_type: String,

        /// JSON parameters
        #[arg(short, long, default_value = "{}")]
        params: String,

        #[arg(short = 'P', long, default_value_t = 0, allow_hyphen_values = true)]
        priority: i32,

        #[arg(long)]
        max_retries: Option<u32>,

        /// Not claimable for this many seconds
        #[arg(long)]
        delay_secs: Option<u64>,
    },

    /// List tasks, newest first
    List {
        #[arg(short, long)]
        status: Option<TaskStatus>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one task as JSON
    Get { id: TaskId },

    /// Cancel a queued or claimed task
    Cancel { id: TaskId },

    /// Show a task's audit trail
    Log { id: TaskId },

    /// Show worker heartbeats
    Workers,

    /// Task totals per status
    Counts,

    /// Requeue tasks held by workers that stopped heartbeating
    Reap {
        /// Heartbeat age that counts as dead (defaults to config)
        #[arg(long)]
        stale_secs: Option<u64>,
    },

    /// Run a worker with the built-in demo handlers (echo, sleep, fail)
    Work {
        #[arg(short, long)]
        strategy: Option<ClaimStrategy>,

        #[arg(long)]
        worker_id: Option<String>,

        /// Stop after this many polls
        #[arg(long)]
        max_iterations: Option<u64>,

        /// Also sweep for abandoned claims every N seconds
        #[arg(long)]
        reap_every_secs: Option<u64>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<SpoolConfig> {
    let config = match &cli.config {
        Some(path) => SpoolConfig::load(path)?,
        None => SpoolConfig::default(),
    };
    let mut config = config.with_env()?;
    if let Some(path) = &cli.database {
        config.database.path = path.clone();
    }
    Ok(config)
}

fn open_store(config: &SpoolConfig) -> anyhow::Result<SqliteTaskStore> {
    let store = SqliteTaskStore::open_with(&config.database.path, config.busy_policy())
        .with_context(|| format!("opening {}", config.database.path.display()))?;
    Ok(store.with_retry_policy(config.retry_policy()?))
}

fn print_task_line(task: &Task) {
    println!(
        "{:<10} {:<20} {:<10} prio={:<4} retries={}/{} owner={}",
        task.id.to_string(),
        task.task_type.as_str(),
        task.status.as_str(),
        task.priority,
        task.retry_count,
        task.max_retries,
        task.claimed_by.as_ref().map(|w| w.as_str()).unwrap_or("-"),
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let config = load_config(&cli)?;
    let store = Arc::new(open_store(&config)?);

    match cli.command {
        Command::Enqueue {
            task_type,
            params,
            priority,
            max_retries,
            delay_secs,
        } => {
            let parameters: serde_json::Value =
                serde_json::from_str(&params).context("--params must be JSON")?;
            let mut task = NewTask::new(task_type.as_str(), parameters).with_priority(priority);
            if let Some(max) = max_retries {
                task = task.with_max_retries(max);
            }
            if let Some(secs) = delay_secs {
                let secs = i64::try_from(secs).context("--delay-secs out of range")?;
                task = task.run_after(Utc::now() + chrono::Duration::seconds(secs));
            }
            let id = store.enqueue(task).await?;
            println!("{id}");
        }
        Command::List { status, limit } => {
            for task in store.list(status, limit).await? {
                print_task_line(&task);
            }
        }
        Command::Get { id } => {
            let Some(task) = store.get(id).await? else {
                bail!("{id} not found");
            };
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        Command::Cancel { id } => {
            if store.cancel(id).await? {
                println!("cancelled {id}");
            } else {
                bail!("{id} is not queued or claimed");
            }
        }
        Command::Log { id } => {
            for entry in store.task_log(id).await? {
                println!(
                    "{} {:<10} {:<24} {}",
                    entry.created_at.to_rfc3339(),
                    entry.event.as_str(),
                    entry.worker_id.as_ref().map(|w| w.as_str()).unwrap_or("-"),
                    entry.message.as_deref().unwrap_or(""),
                );
            }
        }
        Command::Workers => {
            let workers = store.list_workers().await?;
            let now = Utc::now();
            let stale: Vec<_> = stale_workers(&workers, now, config.stale_after())
                .into_iter()
                .map(|beat| beat.worker_id.clone())
                .collect();
            for beat in &workers {
                println!(
                    "{:<32} {:<16} processed={:<6} failed={:<6} task={} age={}s{}",
                    beat.worker_id.as_str(),
                    beat.strategy.as_str(),
                    beat.tasks_processed,
                    beat.tasks_failed,
                    beat.current_task_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    beat.age(now).num_seconds(),
                    if stale.contains(&beat.worker_id) { " STALE" } else { "" },
                );
            }
        }
        Command::Counts => {
            println!("{}", serde_json::to_string_pretty(&store.counts().await?)?);
        }
        Command::Reap { stale_secs } => {
            let stale_after = stale_secs.map_or_else(|| config.stale_after(), Duration::from_secs);
            let released = Reaper::new(store, stale_after).run_once().await?;
            for id in &released {
                println!("requeued {id}");
            }
            info!(count = released.len(), "reap finished");
        }
        Command::Work {
            strategy,
            worker_id,
            max_iterations,
            reap_every_secs,
        } => {
            let reporter_config = config.reporter_config()?;
            let reporter = init_reporter(reporter_config.as_ref()).await;
            let worker_id = match worker_id {
                Some(id) => WorkerId::new(id),
                None => config.worker_id(),
            };
            let stop = StopHandle::new();

            let mut builder = WorkerBuilder::new(store.clone())
                .worker_id(worker_id)
                .strategy(strategy.unwrap_or(config.worker.strategy))
                .poller_config(config.poller_config()?)
                .heartbeat_interval(config.heartbeat_interval()?)
                .reporter(reporter)
                .stop_handle(stop.clone());
            if let Some(rc) = &reporter_config {
                builder = builder.reporter_timeout(rc.timeout);
            }
            let worker = handlers::register(builder)?.build()?;

            let signal = stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("received shutdown signal");
                    signal.stop();
                }
            });

            let reaper = reap_every_secs.map(|secs| {
                let reaper = Reaper::new(store.clone(), config.stale_after());
                let stop = stop.clone();
                tokio::spawn(async move { reaper.run(Duration::from_secs(secs), &stop).await })
            });

            let stats = worker.run(max_iterations).await;
            stop.stop();
            if let Some(handle) = reaper {
                handle.await?;
            }
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}
