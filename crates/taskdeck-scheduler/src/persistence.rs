//! SQLite-backed persistence for task definitions, execution logs, health
//! monitors and overlap leases.
//!
//! One connection behind a mutex; every public method takes the lock for the
//! duration of a single statement (or a short read-modify-write).

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::history::LogClosure;
use crate::monitor::TaskMonitor;
use crate::tasks::{
    ExecutionLog, LogId, NewTask, RunStatus, TaskCategory, TaskDefinition, TaskId, TaskKind,
    TaskParameters, TriggeredBy,
};
use taskdeck_core::error::{Result, TaskdeckError};

const TASK_COLUMNS: &str = "id, name, action, kind, schedule_expression, timezone, description, \
     parameters, is_active, is_system, notification_email, max_runtime_seconds, prevent_overlap, \
     run_in_background, category, created_at, updated_at, deleted_at";

const LOG_COLUMNS: &str = "id, task_id, started_at, finished_at, duration_seconds, status, output, \
     error_message, memory_usage_bytes, triggered_by, triggering_user";

const MONITOR_COLUMNS: &str = "id, task_id, last_success_at, last_failure_at, next_run_at, \
     current_consecutive_failures, max_consecutive_failures, expected_runtime_seconds, is_healthy, \
     health_check_message, updated_at";

/// Listing filter for the admin surface.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub category: Option<TaskCategory>,
    pub active: Option<bool>,
    /// Case-insensitive match on name, action or description.
    pub search: Option<String>,
    /// Needs the monitor, so only `TaskService::list_tasks` applies it.
    pub healthy: Option<bool>,
    pub include_deleted: bool,
}

impl TaskFilter {
    fn matches(&self, task: &TaskDefinition) -> bool {
        if !self.include_deleted && task.is_deleted() {
            return false;
        }
        if self.category.is_some_and(|c| c != task.category) {
            return false;
        }
        if self.active.is_some_and(|a| a != task.is_active) {
            return false;
        }
        match &self.search {
            Some(term) if !term.trim().is_empty() => {
                let term = term.to_lowercase();
                task.name.to_lowercase().contains(&term)
                    || task.action.to_lowercase().contains(&term)
                    || task
                        .description
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&term))
            }
            _ => true,
        }
    }
}

/// SQLite-backed store for all scheduler data.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| db_err("DB open", e))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(|e| db_err("Pragmas", e))?;
        Self::init(conn)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| db_err("DB open", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| db_err("Pragmas", e))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TaskdeckError::Database(format!("connection lock poisoned: {e}")))
    }

    #[cfg(test)]
    pub(crate) fn execute_sql(&self, sql: &str) -> Result<()> {
        self.lock()?.execute_batch(sql).map_err(|e| db_err("Execute", e))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                action TEXT NOT NULL,
                kind TEXT NOT NULL,                     -- 'command', 'unit_of_work', 'inline_script'
                schedule_expression TEXT NOT NULL,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                description TEXT,
                parameters TEXT NOT NULL DEFAULT '[]',  -- JSON array of [name, value]
                is_active INTEGER NOT NULL DEFAULT 1,
                is_system INTEGER NOT NULL DEFAULT 0,
                notification_email TEXT,
                max_runtime_seconds INTEGER,
                prevent_overlap INTEGER NOT NULL DEFAULT 1,
                run_in_background INTEGER NOT NULL DEFAULT 0,
                category TEXT NOT NULL DEFAULT 'other',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_action_kind
                ON scheduled_tasks(action, kind) WHERE deleted_at IS NULL;
            CREATE INDEX IF NOT EXISTS idx_tasks_active_category
                ON scheduled_tasks(is_active, category);

            CREATE TABLE IF NOT EXISTS scheduled_task_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                duration_seconds INTEGER,
                status TEXT NOT NULL,                   -- 'running', 'success', 'failed', 'timeout'
                output TEXT,
                error_message TEXT,
                memory_usage_bytes INTEGER,
                triggered_by TEXT NOT NULL DEFAULT 'schedule',
                triggering_user INTEGER,
                FOREIGN KEY (task_id) REFERENCES scheduled_tasks(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_logs_task_started
                ON scheduled_task_logs(task_id, started_at);
            CREATE INDEX IF NOT EXISTS idx_logs_status_started
                ON scheduled_task_logs(status, started_at);

            CREATE TABLE IF NOT EXISTS scheduled_task_monitors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL UNIQUE,
                last_success_at TEXT,
                last_failure_at TEXT,
                next_run_at TEXT,
                current_consecutive_failures INTEGER NOT NULL DEFAULT 0,
                max_consecutive_failures INTEGER NOT NULL DEFAULT 3,
                expected_runtime_seconds INTEGER,
                is_healthy INTEGER NOT NULL DEFAULT 1,
                health_check_message TEXT,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (task_id) REFERENCES scheduled_tasks(id) ON DELETE CASCADE
            );

            -- Overlap leases (one row per held key)
            CREATE TABLE IF NOT EXISTS task_leases (
                key TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
         ",
            )
            .map_err(|e| db_err("Migration", e))?;
        Ok(())
    }

    // ─── Task Definitions ─────────────────────────────────────

    /// Insert a new task. A duplicate live (action, kind) pair is a validation error.
    pub fn insert_task(&self, task: &NewTask, now: DateTime<Utc>) -> Result<TaskDefinition> {
        let conn = self.lock()?;
        let parameters = serde_json::to_string(&task.parameters)?;
        conn.execute(
            "INSERT INTO scheduled_tasks
             (name, action, kind, schedule_expression, timezone, description, parameters,
              is_active, is_system, notification_email, max_runtime_seconds, prevent_overlap,
              run_in_background, category, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
            rusqlite::params![
                task.name.trim(),
                task.action.trim(),
                task.kind.as_str(),
                task.schedule_expression.trim(),
                task.timezone.trim(),
                task.description,
                parameters,
                task.is_active,
                task.is_system,
                task.notification_email,
                task.max_runtime_seconds.map(|v| v as i64),
                task.prevent_overlap,
                task.run_in_background,
                task.category.as_str(),
                ts(now),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                duplicate_action(&task.action, task.kind)
            } else {
                db_err("Insert task", e)
            }
        })?;
        let id = conn.last_insert_rowid();
        fetch_task(&conn, id, true)?
            .ok_or_else(|| TaskdeckError::Database(format!("task {id} vanished after insert")))
    }

    /// Persist every mutable field of an existing task.
    pub fn update_task(&self, task: &TaskDefinition, now: DateTime<Utc>) -> Result<()> {
        let parameters = serde_json::to_string(&task.parameters)?;
        let changed = self
            .lock()?
            .execute(
                "UPDATE scheduled_tasks SET
                    name = ?2, action = ?3, kind = ?4, schedule_expression = ?5, timezone = ?6,
                    description = ?7, parameters = ?8, is_active = ?9, notification_email = ?10,
                    max_runtime_seconds = ?11, prevent_overlap = ?12, run_in_background = ?13,
                    category = ?14, updated_at = ?15
                 WHERE id = ?1",
                rusqlite::params![
                    task.id,
                    task.name.trim(),
                    task.action.trim(),
                    task.kind.as_str(),
                    task.schedule_expression.trim(),
                    task.timezone.trim(),
                    task.description,
                    parameters,
                    task.is_active,
                    task.notification_email,
                    task.max_runtime_seconds.map(|v| v as i64),
                    task.prevent_overlap,
                    task.run_in_background,
                    task.category.as_str(),
                    ts(now),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    duplicate_action(&task.action, task.kind)
                } else {
                    db_err("Update task", e)
                }
            })?;
        if changed == 0 {
            return Err(TaskdeckError::NotFound(format!("task {}", task.id)));
        }
        Ok(())
    }

    /// A live (not soft-deleted) task by id.
    pub fn get_task(&self, id: TaskId) -> Result<Option<TaskDefinition>> {
        fetch_task(&*self.lock()?, id, false)
    }

    /// A task by id, including soft-deleted rows.
    pub fn get_task_any(&self, id: TaskId) -> Result<Option<TaskDefinition>> {
        fetch_task(&*self.lock()?, id, true)
    }

    /// Active, non-deleted tasks. Rows whose kind tag is not recognised are
    /// logged and skipped so one bad row cannot hide the rest.
    pub fn active_tasks(&self) -> Result<Vec<TaskDefinition>> {
        let rows = self.task_rows("WHERE is_active = 1 AND deleted_at IS NULL ORDER BY id")?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let (id, name) = (row.id, row.name.clone());
                match row.into_task() {
                    Ok(task) => Some(task),
                    Err(e) => {
                        tracing::warn!("⚠️ Skipping task {id} ('{name}'): {e}");
                        None
                    }
                }
            })
            .collect())
    }

    /// Tasks matching `filter`, ordered by category then name.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskDefinition>> {
        let rows = self.task_rows("ORDER BY category, name, id")?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let (id, name) = (row.id, row.name.clone());
            match row.into_task() {
                Ok(task) if filter.matches(&task) => tasks.push(task),
                Ok(_) => {}
                Err(e) => tracing::warn!("⚠️ Skipping task {id} ('{name}'): {e}"),
            }
        }
        Ok(tasks)
    }

    /// A live task with this (action, kind), optionally ignoring one id.
    pub fn find_by_action(
        &self,
        action: &str,
        kind: TaskKind,
        exclude: Option<TaskId>,
    ) -> Result<Option<TaskId>> {
        self.lock()?
            .query_row(
                "SELECT id FROM scheduled_tasks
                 WHERE action = ?1 AND kind = ?2 AND deleted_at IS NULL AND id != ?3
                 LIMIT 1",
                rusqlite::params![action.trim(), kind.as_str(), exclude.unwrap_or(-1)],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_err("Find task", e))
    }

    pub fn set_active(&self, id: TaskId, active: bool, now: DateTime<Utc>) -> Result<()> {
        let changed = self
            .lock()?
            .execute(
                "UPDATE scheduled_tasks SET is_active = ?2, updated_at = ?3
                 WHERE id = ?1 AND deleted_at IS NULL",
                rusqlite::params![id, active, ts(now)],
            )
            .map_err(|e| db_err("Set active", e))?;
        if changed == 0 {
            return Err(TaskdeckError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    /// Mark a task deleted. Its logs and monitor stay in place.
    pub fn soft_delete(&self, id: TaskId, now: DateTime<Utc>) -> Result<()> {
        let changed = self
            .lock()?
            .execute(
                "UPDATE scheduled_tasks SET deleted_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND deleted_at IS NULL",
                rusqlite::params![id, ts(now)],
            )
            .map_err(|e| db_err("Soft delete", e))?;
        if changed == 0 {
            return Err(TaskdeckError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    /// Clear the deleted mark.
    pub fn restore(&self, id: TaskId, now: DateTime<Utc>) -> Result<()> {
        let changed = self
            .lock()?
            .execute(
                "UPDATE scheduled_tasks SET deleted_at = NULL, updated_at = ?2
                 WHERE id = ?1 AND deleted_at IS NOT NULL",
                rusqlite::params![id, ts(now)],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    TaskdeckError::validation(format!(
                        "task {id} cannot be restored: another live task uses the same action"
                    ))
                } else {
                    db_err("Restore", e)
                }
            })?;
        if changed == 0 {
            return Err(TaskdeckError::NotFound(format!("deleted task {id}")));
        }
        Ok(())
    }

    /// Remove a task row; logs and monitor cascade.
    pub fn purge(&self, id: TaskId) -> Result<()> {
        let changed = self
            .lock()?
            .execute("DELETE FROM scheduled_tasks WHERE id = ?1", [id])
            .map_err(|e| db_err("Purge", e))?;
        if changed == 0 {
            return Err(TaskdeckError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    fn task_rows(&self, clause: &str) -> Result<Vec<TaskRow>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks {clause}");
        let mut stmt = conn.prepare(&sql).map_err(|e| db_err("Load tasks", e))?;
        let rows = stmt
            .query_map([], TaskRow::from_row)
            .map_err(|e| db_err("Load tasks", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| db_err("Load tasks", e))?;
        Ok(rows)
    }

    // ─── Execution Logs ───────────────────────────────────────

    /// Insert a Running log row.
    pub fn insert_log(
        &self,
        task_id: TaskId,
        started_at: DateTime<Utc>,
        triggered_by: TriggeredBy,
        triggering_user: Option<i64>,
    ) -> Result<ExecutionLog> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO scheduled_task_logs (task_id, started_at, status, triggered_by, triggering_user)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                task_id,
                ts(started_at),
                RunStatus::Running.as_str(),
                triggered_by.as_str(),
                triggering_user,
            ],
        )
        .map_err(|e| db_err("Insert log", e))?;
        let id = conn.last_insert_rowid();
        fetch_log(&conn, id)?
            .ok_or_else(|| TaskdeckError::Database(format!("log {id} vanished after insert")))
    }

    /// Write the terminal fields of a log that is still open.
    /// Returns false when the log was already closed (or does not exist).
    pub fn finish_log(
        &self,
        id: LogId,
        finished_at: DateTime<Utc>,
        duration_seconds: i64,
        closure: &LogClosure,
    ) -> Result<bool> {
        let changed = self
            .lock()?
            .execute(
                "UPDATE scheduled_task_logs SET
                    finished_at = ?2, duration_seconds = ?3, status = ?4, output = ?5,
                    error_message = ?6, memory_usage_bytes = ?7
                 WHERE id = ?1 AND finished_at IS NULL",
                rusqlite::params![
                    id,
                    ts(finished_at),
                    duration_seconds,
                    closure.status.as_str(),
                    closure.output,
                    closure.error_message,
                    closure.memory_usage_bytes,
                ],
            )
            .map_err(|e| db_err("Finish log", e))?;
        Ok(changed == 1)
    }

    pub fn get_log(&self, id: LogId) -> Result<Option<ExecutionLog>> {
        fetch_log(&*self.lock()?, id)
    }

    /// Most recent run of a task.
    pub fn latest_log(&self, task_id: TaskId) -> Result<Option<ExecutionLog>> {
        Ok(self
            .log_rows("WHERE task_id = ?1 ORDER BY started_at DESC, id DESC LIMIT 1", [task_id])?
            .into_iter()
            .next())
    }

    /// Runs of a task, newest first.
    pub fn logs_for_task(&self, task_id: TaskId, limit: usize) -> Result<Vec<ExecutionLog>> {
        let clause = format!("WHERE task_id = ?1 ORDER BY started_at DESC, id DESC LIMIT {limit}");
        self.log_rows(&clause, [task_id])
    }

    /// Logs of a task that have not been closed yet.
    pub fn open_logs(&self, task_id: TaskId) -> Result<Vec<ExecutionLog>> {
        self.log_rows("WHERE task_id = ?1 AND finished_at IS NULL ORDER BY id", [task_id])
    }

    /// Most recent closed run of a task.
    pub fn latest_closed_log(&self, task_id: TaskId) -> Result<Option<ExecutionLog>> {
        Ok(self
            .log_rows(
                "WHERE task_id = ?1 AND finished_at IS NOT NULL
                 ORDER BY started_at DESC, id DESC LIMIT 1",
                [task_id],
            )?
            .into_iter()
            .next())
    }

    /// Failed or timed-out runs started at or after `since`, newest first.
    pub fn recent_failures(&self, since: DateTime<Utc>) -> Result<Vec<ExecutionLog>> {
        self.log_rows(
            "WHERE status IN ('failed', 'timeout') AND started_at >= ?1
             ORDER BY started_at DESC, id DESC",
            [ts(since)],
        )
    }

    /// Delete closed logs started before `cutoff`. Returns the number removed.
    pub fn prune_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.lock()?
            .execute(
                "DELETE FROM scheduled_task_logs WHERE started_at < ?1 AND finished_at IS NOT NULL",
                [ts(cutoff)],
            )
            .map_err(|e| db_err("Prune logs", e))
    }

    fn log_rows(&self, clause: &str, params: impl rusqlite::Params) -> Result<Vec<ExecutionLog>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {LOG_COLUMNS} FROM scheduled_task_logs {clause}");
        let mut stmt = conn.prepare(&sql).map_err(|e| db_err("Load logs", e))?;
        let rows = stmt
            .query_map(params, LogRow::from_row)
            .map_err(|e| db_err("Load logs", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| db_err("Load logs", e))?;
        rows.into_iter().map(LogRow::into_log).collect()
    }

    // ─── Health Monitors ──────────────────────────────────────

    pub fn get_monitor(&self, task_id: TaskId) -> Result<Option<TaskMonitor>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {MONITOR_COLUMNS} FROM scheduled_task_monitors WHERE task_id = ?1");
        let row = conn
            .query_row(&sql, [task_id], MonitorRow::from_row)
            .optional()
            .map_err(|e| db_err("Load monitor", e))?;
        row.map(MonitorRow::into_monitor).transpose()
    }

    /// Insert or overwrite the monitor row for `monitor.task_id`.
    /// Returns the stored row id.
    pub fn save_monitor(&self, monitor: &TaskMonitor) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO scheduled_task_monitors
             (task_id, last_success_at, last_failure_at, next_run_at, current_consecutive_failures,
              max_consecutive_failures, expected_runtime_seconds, is_healthy, health_check_message,
              updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(task_id) DO UPDATE SET
                last_success_at = excluded.last_success_at,
                last_failure_at = excluded.last_failure_at,
                next_run_at = excluded.next_run_at,
                current_consecutive_failures = excluded.current_consecutive_failures,
                max_consecutive_failures = excluded.max_consecutive_failures,
                expected_runtime_seconds = excluded.expected_runtime_seconds,
                is_healthy = excluded.is_healthy,
                health_check_message = excluded.health_check_message,
                updated_at = excluded.updated_at",
            rusqlite::params![
                monitor.task_id,
                monitor.last_success_at.map(ts),
                monitor.last_failure_at.map(ts),
                monitor.next_run_at.map(ts),
                monitor.current_consecutive_failures,
                monitor.max_consecutive_failures,
                monitor.expected_runtime_seconds.map(|v| v as i64),
                monitor.is_healthy,
                monitor.health_check_message,
                ts(monitor.updated_at),
            ],
        )
        .map_err(|e| db_err("Save monitor", e))?;
        conn.query_row(
            "SELECT id FROM scheduled_task_monitors WHERE task_id = ?1",
            [monitor.task_id],
            |row| row.get(0),
        )
        .map_err(|e| db_err("Save monitor", e))
    }

    /// Monitors of live tasks, optionally only unhealthy ones.
    pub fn list_monitors(&self, unhealthy_only: bool) -> Result<Vec<TaskMonitor>> {
        let conn = self.lock()?;
        let columns = MONITOR_COLUMNS
            .split(", ")
            .map(|c| format!("m.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let filter = if unhealthy_only { "AND m.is_healthy = 0" } else { "" };
        let sql = format!(
            "SELECT {columns} FROM scheduled_task_monitors m
             JOIN scheduled_tasks t ON t.id = m.task_id
             WHERE t.deleted_at IS NULL {filter}
             ORDER BY m.task_id"
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| db_err("Load monitors", e))?;
        let rows = stmt
            .query_map([], MonitorRow::from_row)
            .map_err(|e| db_err("Load monitors", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| db_err("Load monitors", e))?;
        rows.into_iter().map(MonitorRow::into_monitor).collect()
    }

    // ─── Overlap Leases ───────────────────────────────────────

    /// Take `key` for `owner` until `expires_at`. Succeeds when no row exists
    /// or the existing lease has expired; a single upsert keeps it atomic.
    pub fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .lock()?
            .execute(
                "INSERT INTO task_leases (key, owner, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    owner = excluded.owner,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at
                 WHERE task_leases.expires_at <= excluded.acquired_at",
                rusqlite::params![key, owner, ts(now), ts(expires_at)],
            )
            .map_err(|e| db_err("Acquire lease", e))?;
        Ok(changed == 1)
    }

    /// Drop `key` if `owner` still holds it.
    pub fn release_lease(&self, key: &str, owner: &str) -> Result<bool> {
        let changed = self
            .lock()?
            .execute(
                "DELETE FROM task_leases WHERE key = ?1 AND owner = ?2",
                [key, owner],
            )
            .map_err(|e| db_err("Release lease", e))?;
        Ok(changed == 1)
    }

    /// Current holder of `key`, if any lease row exists.
    pub fn lease_owner(&self, key: &str) -> Result<Option<(String, DateTime<Utc>)>> {
        let row: Option<(String, String)> = self
            .lock()?
            .query_row(
                "SELECT owner, expires_at FROM task_leases WHERE key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| db_err("Load lease", e))?;
        match row {
            Some((owner, expires)) => Ok(Some((owner, parse_ts(&expires)?))),
            None => Ok(None),
        }
    }
}

// ─── Row Mapping ──────────────────────────────────────────────

struct TaskRow {
    id: TaskId,
    name: String,
    action: String,
    kind: String,
    schedule_expression: String,
    timezone: String,
    description: Option<String>,
    parameters: String,
    is_active: bool,
    is_system: bool,
    notification_email: Option<String>,
    max_runtime_seconds: Option<i64>,
    prevent_overlap: bool,
    run_in_background: bool,
    category: String,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            action: row.get(2)?,
            kind: row.get(3)?,
            schedule_expression: row.get(4)?,
            timezone: row.get(5)?,
            description: row.get(6)?,
            parameters: row.get(7)?,
            is_active: row.get(8)?,
            is_system: row.get(9)?,
            notification_email: row.get(10)?,
            max_runtime_seconds: row.get(11)?,
            prevent_overlap: row.get(12)?,
            run_in_background: row.get(13)?,
            category: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
            deleted_at: row.get(17)?,
        })
    }

    fn into_task(self) -> Result<TaskDefinition> {
        let kind: TaskKind = self.kind.parse()?;
        let parameters: TaskParameters = if self.parameters.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&self.parameters)?
        };
        Ok(TaskDefinition {
            id: self.id,
            name: self.name,
            action: self.action,
            kind,
            schedule_expression: self.schedule_expression,
            timezone: self.timezone,
            description: self.description,
            parameters,
            is_active: self.is_active,
            is_system: self.is_system,
            notification_email: self.notification_email,
            max_runtime_seconds: self.max_runtime_seconds.map(|v| v.max(0) as u64),
            prevent_overlap: self.prevent_overlap,
            run_in_background: self.run_in_background,
            category: TaskCategory::from_tag(&self.category),
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            deleted_at: self.deleted_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

struct LogRow {
    id: LogId,
    task_id: TaskId,
    started_at: String,
    finished_at: Option<String>,
    duration_seconds: Option<i64>,
    status: String,
    output: Option<String>,
    error_message: Option<String>,
    memory_usage_bytes: Option<i64>,
    triggered_by: String,
    triggering_user: Option<i64>,
}

impl LogRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            started_at: row.get(2)?,
            finished_at: row.get(3)?,
            duration_seconds: row.get(4)?,
            status: row.get(5)?,
            output: row.get(6)?,
            error_message: row.get(7)?,
            memory_usage_bytes: row.get(8)?,
            triggered_by: row.get(9)?,
            triggering_user: row.get(10)?,
        })
    }

    fn into_log(self) -> Result<ExecutionLog> {
        Ok(ExecutionLog {
            id: self.id,
            task_id: self.task_id,
            started_at: parse_ts(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_ts).transpose()?,
            duration_seconds: self.duration_seconds,
            status: RunStatus::from_tag(&self.status)?,
            output: self.output,
            error_message: self.error_message,
            memory_usage_bytes: self.memory_usage_bytes,
            triggered_by: TriggeredBy::from_tag(&self.triggered_by),
            triggering_user: self.triggering_user,
        })
    }
}

struct MonitorRow {
    id: i64,
    task_id: TaskId,
    last_success_at: Option<String>,
    last_failure_at: Option<String>,
    next_run_at: Option<String>,
    current_consecutive_failures: u32,
    max_consecutive_failures: u32,
    expected_runtime_seconds: Option<i64>,
    is_healthy: bool,
    health_check_message: Option<String>,
    updated_at: String,
}

impl MonitorRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            last_success_at: row.get(2)?,
            last_failure_at: row.get(3)?,
            next_run_at: row.get(4)?,
            current_consecutive_failures: row.get(5)?,
            max_consecutive_failures: row.get(6)?,
            expected_runtime_seconds: row.get(7)?,
            is_healthy: row.get(8)?,
            health_check_message: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_monitor(self) -> Result<TaskMonitor> {
        Ok(TaskMonitor {
            id: Some(self.id),
            task_id: self.task_id,
            last_success_at: self.last_success_at.as_deref().map(parse_ts).transpose()?,
            last_failure_at: self.last_failure_at.as_deref().map(parse_ts).transpose()?,
            next_run_at: self.next_run_at.as_deref().map(parse_ts).transpose()?,
            current_consecutive_failures: self.current_consecutive_failures,
            max_consecutive_failures: self.max_consecutive_failures,
            expected_runtime_seconds: self.expected_runtime_seconds.map(|v| v.max(0) as u64),
            is_healthy: self.is_healthy,
            health_check_message: self.health_check_message,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn fetch_task(conn: &Connection, id: TaskId, include_deleted: bool) -> Result<Option<TaskDefinition>> {
    let filter = if include_deleted { "" } else { "AND deleted_at IS NULL" };
    let sql = format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1 {filter}");
    let row = conn
        .query_row(&sql, [id], TaskRow::from_row)
        .optional()
        .map_err(|e| db_err("Load task", e))?;
    row.map(TaskRow::into_task).transpose()
}

fn fetch_log(conn: &Connection, id: LogId) -> Result<Option<ExecutionLog>> {
    let sql = format!("SELECT {LOG_COLUMNS} FROM scheduled_task_logs WHERE id = ?1");
    let row = conn
        .query_row(&sql, [id], LogRow::from_row)
        .optional()
        .map_err(|e| db_err("Load log", e))?;
    row.map(LogRow::into_log).transpose()
}

/// Fixed-width UTC timestamps so lexical order matches time order.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| TaskdeckError::Database(format!("bad timestamp '{s}': {e}")))
}

fn db_err(context: &str, e: rusqlite::Error) -> TaskdeckError {
    TaskdeckError::Database(format!("{context}: {e}"))
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn duplicate_action(action: &str, kind: TaskKind) -> TaskdeckError {
    TaskdeckError::validation(format!(
        "A task with action '{}' and kind '{kind}' already exists",
        action.trim()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn db() -> SchedulerDb {
        SchedulerDb::open_in_memory().unwrap()
    }

    #[test]
    fn test_insert_and_load_task() {
        let db = db();
        let mut new = NewTask::command("Cache warmup", "cache:warmup", "*/30 * * * *");
        new.parameters = vec![
            ("force".into(), serde_json::json!(true)),
            ("limit".into(), serde_json::json!(50)),
        ];
        new.max_runtime_seconds = Some(300);
        let task = db.insert_task(&new, Utc::now()).unwrap();

        let loaded = db.get_task(task.id).unwrap().unwrap();
        assert_eq!(loaded.name, "Cache warmup");
        assert_eq!(loaded.kind, TaskKind::Command);
        assert_eq!(loaded.parameters[0].0, "force");
        assert_eq!(loaded.parameters[1].1, serde_json::json!(50));
        assert_eq!(loaded.max_runtime_seconds, Some(300));
        assert!(loaded.prevent_overlap);
    }

    #[test]
    fn test_duplicate_action_kind_rejected() {
        let db = db();
        let new = NewTask::command("a", "backup:run", "0 3 * * *");
        db.insert_task(&new, Utc::now()).unwrap();
        let err = db.insert_task(&new, Utc::now()).unwrap_err();
        assert!(matches!(err, TaskdeckError::Validation(_)));

        // Same action under another kind is a different task.
        let other = NewTask::new("b", TaskKind::UnitOfWork, "backup:run", "0 3 * * *");
        assert!(db.insert_task(&other, Utc::now()).is_ok());
    }

    #[test]
    fn test_soft_delete_frees_action_and_restore_checks_it() {
        let db = db();
        let now = Utc::now();
        let first = db.insert_task(&NewTask::command("a", "sync:run", "0 * * * *"), now).unwrap();
        db.soft_delete(first.id, now).unwrap();
        assert!(db.get_task(first.id).unwrap().is_none());
        assert!(db.get_task_any(first.id).unwrap().unwrap().is_deleted());

        db.insert_task(&NewTask::command("b", "sync:run", "0 * * * *"), now).unwrap();
        assert!(matches!(db.restore(first.id, now), Err(TaskdeckError::Validation(_))));
    }

    #[test]
    fn test_active_tasks_skip_unknown_kind() {
        let db = db();
        let now = Utc::now();
        db.insert_task(&NewTask::command("good", "good:run", "0 * * * *"), now).unwrap();
        let bad = db.insert_task(&NewTask::command("bad", "bad:run", "0 * * * *"), now).unwrap();
        let mut paused = NewTask::command("paused", "paused:run", "0 * * * *");
        paused.is_active = false;
        db.insert_task(&paused, now).unwrap();

        db.lock()
            .unwrap()
            .execute("UPDATE scheduled_tasks SET kind = 'lambda' WHERE id = ?1", [bad.id])
            .unwrap();

        let active = db.active_tasks().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "good");
        assert!(db.get_task(bad.id).is_err());
    }

    #[test]
    fn test_list_filter() {
        let db = db();
        let now = Utc::now();
        let mut backup = NewTask::command("Nightly backup", "backup:run", "0 3 * * *");
        backup.category = TaskCategory::Backup;
        db.insert_task(&backup, now).unwrap();
        db.insert_task(&NewTask::command("Report", "report:daily", "0 9 * * *"), now).unwrap();

        let filter = TaskFilter { category: Some(TaskCategory::Backup), ..Default::default() };
        assert_eq!(db.list_tasks(&filter).unwrap().len(), 1);
        let filter = TaskFilter { search: Some("REPORT".into()), ..Default::default() };
        assert_eq!(db.list_tasks(&filter).unwrap().len(), 1);
        assert_eq!(db.list_tasks(&TaskFilter::default()).unwrap().len(), 2);
    }

    #[test]
    fn test_finish_log_only_once() {
        let db = db();
        let now = Utc::now();
        let task = db.insert_task(&NewTask::command("a", "a:run", "* * * * *"), now).unwrap();
        let log = db.insert_log(task.id, now, TriggeredBy::Manual, Some(7)).unwrap();
        assert_eq!(log.status, RunStatus::Running);
        assert_eq!(db.open_logs(task.id).unwrap().len(), 1);

        let closure = LogClosure::success("done".into());
        assert!(db.finish_log(log.id, now, 0, &closure).unwrap());
        assert!(!db.finish_log(log.id, now, 0, &closure).unwrap());

        let stored = db.get_log(log.id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert_eq!(stored.triggering_user, Some(7));
        assert!(db.open_logs(task.id).unwrap().is_empty());
    }

    #[test]
    fn test_purge_cascades() {
        let db = db();
        let now = Utc::now();
        let task = db.insert_task(&NewTask::command("a", "a:run", "* * * * *"), now).unwrap();
        let log = db.insert_log(task.id, now, TriggeredBy::Schedule, None).unwrap();
        db.save_monitor(&TaskMonitor::new(task.id, 3, None, now)).unwrap();

        db.purge(task.id).unwrap();
        assert!(db.get_log(log.id).unwrap().is_none());
        assert!(db.get_monitor(task.id).unwrap().is_none());
    }

    #[test]
    fn test_prune_keeps_recent_and_open_logs() {
        let db = db();
        let now = Utc::now();
        let task = db.insert_task(&NewTask::command("a", "a:run", "* * * * *"), now).unwrap();
        let old = db.insert_log(task.id, now - Duration::days(40), TriggeredBy::Schedule, None).unwrap();
        db.finish_log(old.id, now - Duration::days(40), 1, &LogClosure::success(String::new()))
            .unwrap();
        db.insert_log(task.id, now - Duration::days(40), TriggeredBy::Schedule, None).unwrap();
        db.insert_log(task.id, now, TriggeredBy::Schedule, None).unwrap();

        let removed = db.prune_logs_before(now - Duration::days(30)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.logs_for_task(task.id, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_lease_acquire_release_expire() {
        let db = db();
        let now = Utc::now();
        assert!(db.try_acquire_lease("k", "a", now, now + Duration::seconds(60)).unwrap());
        assert!(!db.try_acquire_lease("k", "b", now, now + Duration::seconds(60)).unwrap());
        // Expired leases can be taken over.
        let later = now + Duration::seconds(61);
        assert!(db.try_acquire_lease("k", "b", later, later + Duration::seconds(60)).unwrap());
        assert!(!db.release_lease("k", "a").unwrap());
        assert!(db.release_lease("k", "b").unwrap());
        assert!(db.lease_owner("k").unwrap().is_none());
    }

    #[test]
    fn test_open_file_database() {
        let dir = std::env::temp_dir().join(format!("taskdeck-db-{}", uuid::Uuid::new_v4()));
        let path = dir.join("tasks.db");
        {
            let db = SchedulerDb::open(&path).unwrap();
            db.insert_task(&NewTask::command("a", "a:run", "* * * * *"), Utc::now()).unwrap();
        }
        let db = SchedulerDb::open(&path).unwrap();
        assert_eq!(db.active_tasks().unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
