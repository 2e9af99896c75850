//! Admin surface over the task registry: queries, edits and manual runs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::action::TaskAction;
use crate::builder::task_event_name;
use crate::executor::TaskExecutor;
use crate::history;
use crate::lock::{Lease, OverlapGuard};
use crate::monitor::{self, TaskMonitor};
use crate::persistence::{SchedulerDb, TaskFilter};
use crate::registry;
use crate::tasks::{
    ExecutionLog, LogId, NewTask, RunStatus, TaskDefinition, TaskId, TaskUpdate, TriggeredBy,
};
use crate::worker::{ExecutionRequest, WorkerPool};
use taskdeck_core::config::SchedulerConfig;
use taskdeck_core::error::{Result, TaskdeckError};

/// One row of the task list.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOverview {
    pub task: TaskDefinition,
    pub monitor: Option<TaskMonitor>,
    pub latest_log: Option<ExecutionLog>,
    pub next_run: Option<DateTime<Utc>>,
}

/// How a manual run was requested.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub triggered_by: TriggeredBy,
    pub user: Option<i64>,
    /// For background tasks: how long to wait for the run to finish.
    pub wait: Option<Duration>,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self { triggered_by: TriggeredBy::Manual, user: None, wait: None }
    }
}

/// Result of a manual run.
#[derive(Debug, Clone, Serialize)]
pub struct RunNowOutcome {
    pub log_id: LogId,
    /// Running when a background run did not finish within the wait.
    pub status: RunStatus,
    pub error: Option<String>,
}

pub struct TaskService {
    db: Arc<SchedulerDb>,
    executor: TaskExecutor,
    workers: Option<Arc<WorkerPool>>,
    overlap: Arc<dyn OverlapGuard>,
    config: SchedulerConfig,
}

impl TaskService {
    pub fn new(
        db: Arc<SchedulerDb>,
        executor: TaskExecutor,
        workers: Option<Arc<WorkerPool>>,
        overlap: Arc<dyn OverlapGuard>,
        config: SchedulerConfig,
    ) -> Self {
        Self { db, executor, workers, overlap, config }
    }

    pub fn db(&self) -> &Arc<SchedulerDb> {
        &self.db
    }

    // ─── Queries ──────────────────────────────────────────────

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskOverview>> {
        let now = Utc::now();
        let mut rows = Vec::new();
        for task in self.db.list_tasks(filter)? {
            let monitor = self.db.get_monitor(task.id)?;
            if let Some(healthy) = filter.healthy {
                // Tasks without a monitor have never failed.
                let is_healthy = monitor.as_ref().is_none_or(|m| m.is_healthy);
                if is_healthy != healthy {
                    continue;
                }
            }
            rows.push(TaskOverview {
                latest_log: self.db.latest_log(task.id)?,
                next_run: task.next_fire_time(now),
                monitor,
                task,
            });
        }
        Ok(rows)
    }

    pub fn get_task(&self, id: TaskId) -> Result<TaskDefinition> {
        self.db
            .get_task(id)?
            .ok_or_else(|| TaskdeckError::NotFound(format!("task {id}")))
    }

    pub fn next_run(&self, id: TaskId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.get_task(id)?.next_fire_time(Utc::now()))
    }

    pub fn today_runs(&self, id: TaskId, now: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>> {
        Ok(self.get_task(id)?.today_runs(now))
    }

    pub fn tomorrow_runs(&self, id: TaskId, now: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>> {
        Ok(self.get_task(id)?.tomorrow_runs(now))
    }

    pub fn latest_log(&self, id: TaskId) -> Result<Option<ExecutionLog>> {
        history::latest_log(&self.db, id)
    }

    pub fn logs(&self, id: TaskId, limit: usize) -> Result<Vec<ExecutionLog>> {
        history::logs_for_task(&self.db, id, limit)
    }

    pub fn recent_failures(&self, since: DateTime<Utc>) -> Result<Vec<ExecutionLog>> {
        history::recent_failures(&self.db, since)
    }

    pub fn monitor(&self, id: TaskId) -> Result<Option<TaskMonitor>> {
        self.db.get_monitor(id)
    }

    /// Live tasks whose monitor says unhealthy.
    pub fn unhealthy_tasks(&self) -> Result<Vec<(TaskDefinition, TaskMonitor)>> {
        let mut out = Vec::new();
        for monitor in self.db.list_monitors(true)? {
            if let Some(task) = self.db.get_task(monitor.task_id)? {
                out.push((task, monitor));
            }
        }
        Ok(out)
    }

    // ─── Commands ─────────────────────────────────────────────

    pub fn create_task(&self, mut new: NewTask) -> Result<TaskDefinition> {
        if new.timezone.trim().is_empty() {
            new.timezone = self.config.default_timezone.clone();
        }
        new.validate()?;
        registry::validate_against_store(&self.db, &new.action, new.kind, None)?;
        let task = self.db.insert_task(&new, Utc::now())?;
        monitor::initialize(&self.db, &task, self.config.max_consecutive_failures)?;
        tracing::info!("📅 Task created: {} ('{}') [{}]", task.id, task.name, task.describe_schedule());
        Ok(task)
    }

    pub fn update_task(&self, id: TaskId, update: TaskUpdate) -> Result<TaskDefinition> {
        let mut task = self.get_task(id)?;
        update.apply(&mut task)?;
        registry::validate_against_store(&self.db, &task.action, task.kind, Some(id))?;
        self.db.update_task(&task, Utc::now())?;
        monitor::initialize(&self.db, &task, self.config.max_consecutive_failures)?;
        tracing::info!("📝 Task updated: {} ('{}')", task.id, task.name);
        self.get_task(id)
    }

    pub fn set_active(&self, id: TaskId, active: bool) -> Result<TaskDefinition> {
        self.db.set_active(id, active, Utc::now())?;
        let task = self.get_task(id)?;
        monitor::initialize(&self.db, &task, self.config.max_consecutive_failures)?;
        tracing::info!(
            "{} Task {} ('{}') {}",
            if active { "▶️" } else { "⏸️" },
            task.id,
            task.name,
            if active { "enabled" } else { "disabled" }
        );
        Ok(task)
    }

    /// Flip `is_active`; returns the new value.
    pub fn toggle_active(&self, id: TaskId) -> Result<bool> {
        let task = self.get_task(id)?;
        Ok(self.set_active(id, !task.is_active)?.is_active)
    }

    /// Run a task now, outside its schedule.
    ///
    /// The action is resolved before a log is opened. Foreground tasks run
    /// inline. Background tasks are queued and, when `wait` is set, polled
    /// once a second until they finish or the wait (capped by config) runs out.
    pub async fn run_now(&self, id: TaskId, request: RunRequest) -> Result<RunNowOutcome> {
        let task = self.get_task(id)?;
        TaskAction::resolve(&task)?;

        let lease = if task.prevent_overlap {
            let ttl = task.timeout(self.config.default_timeout_secs)
                + Duration::from_secs(self.config.lease_grace_secs);
            match Lease::acquire(&self.overlap, &task_event_name(task.id), ttl)? {
                Some(lease) => Some(lease),
                None => {
                    return Err(TaskdeckError::Forbidden(format!(
                        "task {} is already running",
                        task.id
                    )));
                }
            }
        } else {
            None
        };

        let log = history::open(&self.db, task.id, request.triggered_by, request.user)?;
        let log_id = log.id;
        tracing::info!("🔔 Manual run of task {} ('{}'), log {log_id}", task.id, task.name);

        if task.run_in_background {
            if let Some(pool) = &self.workers {
                pool.enqueue(ExecutionRequest { task, log, lease })?;
                return self.wait_for(log_id, request.wait).await;
            }
        }

        let result = self.executor.execute(&task, log).await;
        drop(lease);
        let stored = history::find_log(&self.db, log_id)?;
        Ok(RunNowOutcome {
            log_id,
            status: stored.map(|l| l.status).unwrap_or(RunStatus::Failed),
            error: result.err().map(|e| e.to_string()),
        })
    }

    async fn wait_for(&self, log_id: LogId, wait: Option<Duration>) -> Result<RunNowOutcome> {
        let cap = Duration::from_secs(self.config.run_now_wait_secs);
        let deadline = tokio::time::Instant::now() + wait.unwrap_or(Duration::ZERO).min(cap);
        loop {
            let log = history::find_log(&self.db, log_id)?
                .ok_or_else(|| TaskdeckError::NotFound(format!("execution log {log_id}")))?;
            if log.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(RunNowOutcome {
                    log_id,
                    status: log.status,
                    error: log.error_message,
                });
            }
            tokio::time::sleep(Duration::from_secs(1).min(deadline - tokio::time::Instant::now()))
                .await;
        }
    }

    /// Soft delete. System tasks cannot be deleted.
    pub fn delete_task(&self, id: TaskId) -> Result<()> {
        let task = self.get_task(id)?;
        if task.is_system {
            return Err(TaskdeckError::Forbidden(format!(
                "task {} ('{}') is a system task and cannot be deleted",
                task.id, task.name
            )));
        }
        self.db.soft_delete(id, Utc::now())?;
        tracing::info!("🗑️ Task deleted: {} ('{}')", task.id, task.name);
        Ok(())
    }

    pub fn restore_task(&self, id: TaskId) -> Result<TaskDefinition> {
        self.db.restore(id, Utc::now())?;
        let task = self.get_task(id)?;
        monitor::initialize(&self.db, &task, self.config.max_consecutive_failures)?;
        tracing::info!("♻️ Task restored: {} ('{}')", task.id, task.name);
        Ok(task)
    }

    /// Hard delete, including logs and monitor.
    pub fn purge_task(&self, id: TaskId) -> Result<()> {
        let task = self
            .db
            .get_task_any(id)?
            .ok_or_else(|| TaskdeckError::NotFound(format!("task {id}")))?;
        if task.is_system {
            return Err(TaskdeckError::Forbidden(format!(
                "task {} ('{}') is a system task and cannot be purged",
                task.id, task.name
            )));
        }
        self.db.purge(id)?;
        tracing::info!("🗑️ Task purged: {} ('{}')", task.id, task.name);
        Ok(())
    }

    /// Re-evaluate health for every live task.
    pub fn check_all_health(&self) -> Result<Vec<(TaskId, bool)>> {
        let tasks = self.db.list_tasks(&TaskFilter::default())?;
        let mut results = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let healthy = monitor::check_health(&self.db, task, self.config.max_consecutive_failures)?;
            if !healthy {
                tracing::warn!("⚠️ Task {} ('{}') is unhealthy", task.id, task.name);
            }
            results.push((task.id, healthy));
        }
        Ok(results)
    }

    /// Delete closed logs older than `days` (config default when `None`).
    pub fn prune_logs(&self, days: Option<u32>) -> Result<usize> {
        history::prune_logs(&self.db, days.unwrap_or(self.config.log_retention_days))
    }
}
