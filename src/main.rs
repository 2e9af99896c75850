//! # Taskdeck: scheduled task engine
//!
//! Usage:
//!   taskdeck serve                       # Run the scheduler until Ctrl+C
//!   taskdeck list --unhealthy            # Tasks with failing monitors
//!   taskdeck run 3 --wait 30             # Run task 3 now, wait up to 30s
//!   taskdeck preview "*/15 * * * *" --timezone Asia/Seoul

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use taskdeck_core::TaskdeckConfig;
use taskdeck_scheduler::cron::{self, CronSchedule};
use taskdeck_scheduler::{
    ExecutorSettings, JobRegistry, Notifier, RunRequest, ScheduleBuilder, SchedulerDb,
    SchedulerEngine, ShellCommandRunner, TaskCategory, TaskExecutor, TaskFilter, TaskOverview,
    TaskService, TriggeredBy, WorkerPool, overlap_guard, seed, spawn_scheduler,
};

#[derive(Parser)]
#[command(name = "taskdeck", version, about = "⏰ Taskdeck: database-driven cron task engine")]
struct Cli {
    /// Config file (default: ~/.taskdeck/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop
    Serve,
    /// List tasks with health and next run
    List {
        #[arg(long)]
        category: Option<String>,
        /// Only active tasks
        #[arg(long, conflicts_with = "inactive")]
        active: bool,
        /// Only inactive tasks
        #[arg(long)]
        inactive: bool,
        /// Only unhealthy tasks
        #[arg(long)]
        unhealthy: bool,
        /// Include soft-deleted tasks
        #[arg(long)]
        deleted: bool,
        /// Free-text search on name, action and description
        #[arg(long)]
        search: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Activate a task
    Enable { id: i64 },
    /// Deactivate a task
    Disable { id: i64 },
    /// Run a task now
    Run {
        id: i64,
        /// Seconds to wait for a background run
        #[arg(long)]
        wait: Option<u64>,
        /// Recorded as the triggering user
        #[arg(long)]
        user: Option<i64>,
    },
    /// Soft-delete a task (or remove it with --purge)
    Delete {
        id: i64,
        #[arg(long)]
        purge: bool,
    },
    /// Undo a soft delete
    Restore { id: i64 },
    /// Re-check every monitor and list unhealthy tasks
    Health,
    /// Show upcoming fire times for an expression or a task
    Preview {
        /// Cron expression (ignored with --task)
        expression: Option<String>,
        #[arg(long, default_value = "UTC")]
        timezone: String,
        /// Preview a stored task's today/tomorrow runs
        #[arg(long)]
        task: Option<i64>,
        #[arg(long, default_value = "5")]
        count: usize,
    },
    /// Install the default task set (skips existing ones)
    Seed,
    /// Delete closed execution logs older than N days
    Prune {
        #[arg(long)]
        days: Option<u32>,
    },
}

struct Runtime {
    config: TaskdeckConfig,
    db: Arc<SchedulerDb>,
    executor: TaskExecutor,
}

impl Runtime {
    fn open(config: TaskdeckConfig) -> Result<Self> {
        let path = config.database.resolved_path();
        let db = Arc::new(
            SchedulerDb::open(&path).with_context(|| format!("opening {}", path.display()))?,
        );
        let executor = TaskExecutor::new(
            db.clone(),
            Arc::new(ShellCommandRunner::new(&config.commands)),
            Arc::new(JobRegistry::new()),
            Arc::new(Notifier::from_config(&config.notify)),
            ExecutorSettings::from(&config.scheduler),
        );
        Ok(Self { config, db, executor })
    }

    fn service(&self, workers: Option<Arc<WorkerPool>>) -> TaskService {
        TaskService::new(
            self.db.clone(),
            self.executor.clone(),
            workers,
            overlap_guard(self.config.scheduler.overlap_backend, &self.db),
            self.config.scheduler.clone(),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "taskdeck=debug,taskdeck_scheduler=debug"
    } else {
        "taskdeck=info,taskdeck_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => TaskdeckConfig::load_from(&PathBuf::from(shellexpand::tilde(path).to_string()))?,
        None => TaskdeckConfig::load()?,
    };
    let runtime = Runtime::open(config)?;

    match cli.command {
        Command::Serve => serve(runtime).await?,
        Command::List { category, active, inactive, unhealthy, deleted, search, json } => {
            let filter = TaskFilter {
                category: category.as_deref().map(TaskCategory::from_tag),
                active: if active { Some(true) } else if inactive { Some(false) } else { None },
                search,
                healthy: unhealthy.then_some(false),
                include_deleted: deleted,
            };
            let rows = runtime.service(None).list_tasks(&filter)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_tasks(&rows);
            }
        }
        Command::Enable { id } => {
            let task = runtime.service(None).set_active(id, true)?;
            println!(
                "▶️  Task {} ('{}') enabled, next run {}",
                task.id,
                task.name,
                fmt_time(task.next_fire_time(Utc::now()))
            );
        }
        Command::Disable { id } => {
            let task = runtime.service(None).set_active(id, false)?;
            println!("⏸️  Task {} ('{}') disabled", task.id, task.name);
        }
        Command::Run { id, wait, user } => {
            let request = RunRequest {
                triggered_by: TriggeredBy::Manual,
                user,
                wait: wait.map(Duration::from_secs),
            };
            // Background tasks go through a one-worker pool; shutdown lets
            // a run that outlived --wait finish before the process exits.
            let pool = Arc::new(WorkerPool::start(runtime.executor.clone(), 1, 1));
            let result = runtime.service(Some(pool.clone())).run_now(id, request).await;
            pool.shutdown().await;
            let outcome = result?;
            println!("🔔 Task {id}: log {} → {}", outcome.log_id, outcome.status);
            if let Some(error) = outcome.error {
                println!("   {error}");
            }
        }
        Command::Delete { id, purge } => {
            let service = runtime.service(None);
            if purge {
                service.purge_task(id)?;
                println!("🗑️  Task {id} purged");
            } else {
                service.delete_task(id)?;
                println!("🗑️  Task {id} deleted (restore with `taskdeck restore {id}`)");
            }
        }
        Command::Restore { id } => {
            let task = runtime.service(None).restore_task(id)?;
            println!("♻️  Task {} ('{}') restored", task.id, task.name);
        }
        Command::Health => {
            let service = runtime.service(None);
            let results = service.check_all_health()?;
            let unhealthy = service.unhealthy_tasks()?;
            println!("🩺 {} tasks checked, {} unhealthy", results.len(), unhealthy.len());
            for (task, monitor) in unhealthy {
                println!(
                    "   ⚠️  {} ({}): {}",
                    task.name,
                    task.id,
                    monitor.health_check_message.as_deref().unwrap_or("unhealthy")
                );
            }
        }
        Command::Preview { expression, timezone, task, count } => {
            preview(&runtime, expression, &timezone, task, count)?;
        }
        Command::Seed => {
            let created = seed::seed_defaults(&runtime.service(None))?;
            println!("🌱 {} default tasks installed", created.len());
            for task in created {
                println!("   {} ({}) [{}]", task.name, task.id, task.describe_schedule());
            }
        }
        Command::Prune { days } => {
            let removed = runtime.service(None).prune_logs(days)?;
            println!("🧹 {removed} execution logs removed");
        }
    }
    Ok(())
}

async fn serve(runtime: Runtime) -> Result<()> {
    let settings = &runtime.config.scheduler;
    let pool = Arc::new(WorkerPool::start(
        runtime.executor.clone(),
        settings.worker_count,
        settings.queue_capacity,
    ));
    let engine = Arc::new(Mutex::new(SchedulerEngine::new(
        runtime.db.clone(),
        runtime.executor.clone(),
        overlap_guard(settings.overlap_backend, &runtime.db),
        Some(pool.clone()),
        settings.lease_grace_secs,
    )));
    let builder = ScheduleBuilder::new(runtime.db.clone())
        .with_static_entries(runtime.config.static_entries.clone())
        .with_settings(settings);

    println!("⏰ Taskdeck scheduler running (Ctrl+C to stop)");
    tokio::select! {
        _ = spawn_scheduler(engine, builder, settings.tick_interval_secs, settings.rebuild_interval_secs) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("listening for Ctrl+C")?;
            tracing::info!("🛑 Shutdown requested");
        }
    }
    pool.shutdown().await;
    Ok(())
}

fn preview(
    runtime: &Runtime,
    expression: Option<String>,
    timezone: &str,
    task: Option<i64>,
    count: usize,
) -> Result<()> {
    let now = Utc::now();
    if let Some(id) = task {
        let service = runtime.service(None);
        let task = service.get_task(id)?;
        println!("📅 {} [{}]", task.name, task.describe_schedule());
        println!("   Today:    {}", fmt_times(&service.today_runs(id, now)?));
        println!("   Tomorrow: {}", fmt_times(&service.tomorrow_runs(id, now)?));
        return Ok(());
    }

    let expression = expression.context("give a cron expression or --task <id>")?;
    let schedule = CronSchedule::parse(&expression, timezone)?;
    println!("📅 {expression} ({timezone}): {}", cron::describe_expression(&expression));
    let mut cursor = now;
    for _ in 0..count {
        let Some(next) = schedule.next_after(cursor) else { break };
        println!("   {}", next.with_timezone(&schedule.timezone()).format("%Y-%m-%d %H:%M %Z"));
        cursor = next;
    }
    Ok(())
}

fn print_tasks(rows: &[TaskOverview]) {
    if rows.is_empty() {
        println!("No tasks.");
        return;
    }
    println!(
        "{:>4}  {:<28} {:<12} {:<16} {:<8} {:<9} {:<17}",
        "ID", "NAME", "CATEGORY", "SCHEDULE", "ACTIVE", "HEALTH", "NEXT RUN (UTC)"
    );
    for row in rows {
        let health = match &row.monitor {
            Some(m) if !m.is_healthy => "⚠️ failing",
            _ => "ok",
        };
        let mut name = row.task.name.clone();
        if row.task.is_deleted() {
            name.push_str(" (deleted)");
        }
        println!(
            "{:>4}  {:<28} {:<12} {:<16} {:<8} {:<9} {:<17}",
            row.task.id,
            name,
            row.task.category.as_str(),
            row.task.schedule_expression,
            if row.task.is_active { "yes" } else { "no" },
            health,
            fmt_time(row.next_run),
        );
    }
}

fn fmt_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".into())
}

fn fmt_times(times: &[DateTime<Utc>]) -> String {
    if times.is_empty() {
        return "-".into();
    }
    times
        .iter()
        .map(|t| t.format("%H:%M").to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
