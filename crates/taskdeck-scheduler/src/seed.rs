//! Default task set installed by `taskdeck seed`.

use serde_json::json;

use crate::service::TaskService;
use crate::tasks::{NewTask, TaskCategory, TaskDefinition, TaskKind};
use taskdeck_core::error::Result;

/// Backup, report, cleanup and upkeep tasks. An empty timezone means the
/// configured default.
pub fn default_tasks() -> Vec<NewTask> {
    let mut tasks = Vec::new();

    let mut full_backup = NewTask::command("Daily backup", "backup:run", "0 3 * * *");
    full_backup.description = Some("Full system backup every night at 03:00.".into());
    full_backup.category = TaskCategory::Backup;
    full_backup.is_system = true;
    full_backup.run_in_background = true;
    full_backup.max_runtime_seconds = Some(3600);
    tasks.push(full_backup);

    let mut db_backup = NewTask::command("Database backup", "backup:run --only-db", "0 */6 * * *");
    db_backup.description = Some("Database-only backup every six hours.".into());
    db_backup.category = TaskCategory::Backup;
    db_backup.is_system = true;
    db_backup.run_in_background = true;
    db_backup.max_runtime_seconds = Some(600);
    tasks.push(db_backup);

    let mut telemetry = NewTask::command("Daily telemetry report", "telemetry:report daily", "0 9 * * *");
    telemetry.description = Some("Telemetry summary every morning at 09:00.".into());
    telemetry.category = TaskCategory::Report;
    telemetry.is_system = true;
    telemetry.prevent_overlap = false;
    tasks.push(telemetry);

    let mut log_clear = NewTask::command("Clear old logs", "log:clear", "0 2 * * 0");
    log_clear.description = Some("Removes application logs older than 30 days, Sundays at 02:00.".into());
    log_clear.category = TaskCategory::Cleanup;
    log_clear.run_in_background = true;
    log_clear.parameters = vec![("days".into(), json!(30))];
    tasks.push(log_clear);

    let mut failed_jobs = NewTask::command("Prune failed jobs", "queue:prune-failed", "0 0 * * 0");
    failed_jobs.description = Some("Drops failed queue jobs older than a week, Sundays at midnight.".into());
    failed_jobs.category = TaskCategory::Cleanup;
    failed_jobs.is_system = true;
    failed_jobs.prevent_overlap = false;
    failed_jobs.parameters = vec![("hours".into(), json!(168))];
    tasks.push(failed_jobs);

    let mut daily_stats = NewTask::new(
        "Daily statistics report",
        TaskKind::UnitOfWork,
        "reports.daily_statistics",
        "0 8 * * *",
    );
    daily_stats.description = Some("Builds the daily statistics report at 08:00.".into());
    daily_stats.category = TaskCategory::Report;
    daily_stats.is_active = false;
    daily_stats.run_in_background = true;
    daily_stats.notification_email = Some("admin@example.com".into());
    tasks.push(daily_stats);

    let mut warmup = NewTask::command("Cache warmup", "cache:warmup", "*/30 * * * *");
    warmup.description = Some("Rebuilds hot cache entries every 30 minutes.".into());
    warmup.category = TaskCategory::Maintenance;
    warmup.is_active = false;
    tasks.push(warmup);

    let mut prune = NewTask::new(
        "Prune execution history",
        TaskKind::InlineScript,
        "prune-execution-logs",
        "30 4 * * *",
    );
    prune.description = Some("Deletes closed execution logs past the retention window.".into());
    prune.category = TaskCategory::Maintenance;
    prune.is_system = true;
    tasks.push(prune);

    let mut health = NewTask::new("Refresh task health", TaskKind::InlineScript, "refresh-health", "*/15 * * * *");
    health.description = Some("Re-evaluates every task monitor.".into());
    health.category = TaskCategory::Maintenance;
    health.is_system = true;
    tasks.push(health);

    for task in &mut tasks {
        task.timezone = String::new();
    }
    tasks
}

/// Insert any default task whose (action, kind) is not present yet.
/// Returns the tasks that were created.
pub fn seed_defaults(service: &TaskService) -> Result<Vec<TaskDefinition>> {
    let mut created = Vec::new();
    for task in default_tasks() {
        if service.db().find_by_action(&task.action, task.kind, None)?.is_some() {
            tracing::debug!("🌱 Seed task '{}' already present", task.name);
            continue;
        }
        created.push(service.create_task(task)?);
    }
    tracing::info!("🌱 Seeded {} default tasks", created.len());
    Ok(created)
}
