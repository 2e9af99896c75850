//! Execution log lifecycle: one row per run attempt, closed exactly once.

use chrono::{DateTime, Utc};

use crate::persistence::SchedulerDb;
use crate::tasks::{ExecutionLog, LogId, RunStatus, TaskId, TriggeredBy};
use taskdeck_core::error::{Result, TaskdeckError};

/// Terminal fields written when a run ends.
#[derive(Debug, Clone, PartialEq)]
pub struct LogClosure {
    pub status: RunStatus,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub memory_usage_bytes: Option<i64>,
}

impl LogClosure {
    pub fn success(output: String) -> Self {
        Self {
            status: RunStatus::Success,
            output: non_empty(output),
            error_message: None,
            memory_usage_bytes: None,
        }
    }

    pub fn failure(status: RunStatus, message: impl Into<String>, output: String) -> Self {
        Self {
            status,
            output: non_empty(output),
            error_message: Some(message.into()),
            memory_usage_bytes: None,
        }
    }

    pub fn with_memory(mut self, bytes: Option<i64>) -> Self {
        self.memory_usage_bytes = bytes;
        self
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

/// Create the Running row for a run that is about to start.
/// This is the only way a log comes into existence.
pub fn open(
    db: &SchedulerDb,
    task_id: TaskId,
    triggered_by: TriggeredBy,
    user: Option<i64>,
) -> Result<ExecutionLog> {
    let log = db.insert_log(task_id, Utc::now(), triggered_by, user)?;
    tracing::debug!("📝 Opened log {} for task {task_id} ({})", log.id, triggered_by.as_str());
    Ok(log)
}

/// Move a Running log to its terminal state.
///
/// Fails with `LogAlreadyClosed` on the second call for the same log and with
/// `Validation` for a non-terminal status. Output longer than `output_limit`
/// bytes is cut at a character boundary.
pub fn close(
    db: &SchedulerDb,
    log_id: LogId,
    mut closure: LogClosure,
    output_limit: usize,
) -> Result<ExecutionLog> {
    if !closure.status.is_terminal() {
        return Err(TaskdeckError::validation(format!(
            "cannot close log {log_id} with non-terminal status '{}'",
            closure.status
        )));
    }
    let log = db
        .get_log(log_id)?
        .ok_or_else(|| TaskdeckError::NotFound(format!("execution log {log_id}")))?;
    if log.is_closed() {
        return Err(TaskdeckError::LogAlreadyClosed(log_id));
    }

    closure.output = closure.output.map(|o| truncate_output(o, output_limit));
    let finished_at = Utc::now().max(log.started_at);
    let duration = duration_seconds(log.started_at, finished_at);

    // The update only matches while finished_at is still NULL, so a racing
    // second closer sees zero rows.
    if !db.finish_log(log_id, finished_at, duration, &closure)? {
        return Err(TaskdeckError::LogAlreadyClosed(log_id));
    }
    db.get_log(log_id)?
        .ok_or_else(|| TaskdeckError::NotFound(format!("execution log {log_id}")))
}

fn duration_seconds(started: DateTime<Utc>, finished: DateTime<Utc>) -> i64 {
    (finished - started).num_seconds().max(0)
}

/// Keep at most `limit` bytes, cut on a UTF-8 boundary.
pub fn truncate_output(output: String, limit: usize) -> String {
    if output.len() <= limit {
        return output;
    }
    let mut end = limit;
    while end > 0 && !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...\n[truncated, {} bytes total]", &output[..end], output.len())
}

// ─── Queries ──────────────────────────────────────────────────

pub fn find_log(db: &SchedulerDb, id: LogId) -> Result<Option<ExecutionLog>> {
    db.get_log(id)
}

pub fn latest_log(db: &SchedulerDb, task_id: TaskId) -> Result<Option<ExecutionLog>> {
    db.latest_log(task_id)
}

pub fn logs_for_task(db: &SchedulerDb, task_id: TaskId, limit: usize) -> Result<Vec<ExecutionLog>> {
    db.logs_for_task(task_id, limit)
}

pub fn recent_failures(db: &SchedulerDb, since: DateTime<Utc>) -> Result<Vec<ExecutionLog>> {
    db.recent_failures(since)
}

/// Delete closed logs older than `older_than_days`. Open logs are kept.
pub fn prune_logs(db: &SchedulerDb, older_than_days: u32) -> Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
    let removed = db.prune_logs_before(cutoff)?;
    if removed > 0 {
        tracing::info!("🧹 Pruned {removed} execution logs older than {older_than_days} days");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::NewTask;

    fn setup() -> (SchedulerDb, TaskId) {
        let db = SchedulerDb::open_in_memory().unwrap();
        let task = db
            .insert_task(&NewTask::command("Report", "report:daily", "0 9 * * *"), Utc::now())
            .unwrap();
        (db, task.id)
    }

    #[test]
    fn test_open_then_close_failed() {
        let (db, task_id) = setup();
        let log = open(&db, task_id, TriggeredBy::Schedule, None).unwrap();
        assert_eq!(log.status, RunStatus::Running);
        assert!(log.finished_at.is_none());

        let closed = close(
            &db,
            log.id,
            LogClosure::failure(RunStatus::Failed, "exit code 1", "partial".into()),
            1024,
        )
        .unwrap();
        assert_eq!(closed.status, RunStatus::Failed);
        assert!(closed.finished_at.is_some());
        assert!(closed.duration_seconds.unwrap() >= 0);
        assert_eq!(closed.error_message.as_deref(), Some("exit code 1"));
        assert_eq!(closed.output.as_deref(), Some("partial"));
    }

    #[test]
    fn test_second_close_is_rejected() {
        let (db, task_id) = setup();
        let log = open(&db, task_id, TriggeredBy::Manual, Some(3)).unwrap();
        close(&db, log.id, LogClosure::success("ok".into()), 1024).unwrap();

        let err = close(&db, log.id, LogClosure::success("again".into()), 1024).unwrap_err();
        assert!(matches!(err, TaskdeckError::LogAlreadyClosed(id) if id == log.id));
        let stored = find_log(&db, log.id).unwrap().unwrap();
        assert_eq!(stored.output.as_deref(), Some("ok"));
    }

    #[test]
    fn test_non_terminal_close_is_rejected() {
        let (db, task_id) = setup();
        let log = open(&db, task_id, TriggeredBy::Schedule, None).unwrap();
        let closure = LogClosure {
            status: RunStatus::Running,
            output: None,
            error_message: None,
            memory_usage_bytes: None,
        };
        assert!(matches!(close(&db, log.id, closure, 1024), Err(TaskdeckError::Validation(_))));
        assert!(find_log(&db, log.id).unwrap().unwrap().finished_at.is_none());
    }

    #[test]
    fn test_output_truncated_on_char_boundary() {
        let long = "é".repeat(100);
        let cut = truncate_output(long.clone(), 7);
        assert!(cut.starts_with("ééé..."));
        assert!(cut.contains("200 bytes total"));
        assert_eq!(truncate_output("short".into(), 7), "short");
    }

    #[test]
    fn test_recent_failures_and_latest() {
        let (db, task_id) = setup();
        let since = Utc::now() - chrono::Duration::minutes(1);
        let first = open(&db, task_id, TriggeredBy::Schedule, None).unwrap();
        close(&db, first.id, LogClosure::failure(RunStatus::TimedOut, "timed out", String::new()), 64)
            .unwrap();
        let second = open(&db, task_id, TriggeredBy::Schedule, None).unwrap();
        close(&db, second.id, LogClosure::success(String::new()), 64).unwrap();

        let failures = recent_failures(&db, since).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].status, RunStatus::TimedOut);
        assert_eq!(latest_log(&db, task_id).unwrap().unwrap().id, second.id);
        assert_eq!(logs_for_task(&db, task_id, 10).unwrap().len(), 2);
    }
}
