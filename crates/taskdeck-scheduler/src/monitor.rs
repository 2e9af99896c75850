//! Derived per-task health: consecutive failures and runtime anomalies.
//!
//! A task is unhealthy when its failure streak reaches the threshold, or when
//! its most recent closed run took more than twice the expected runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persistence::SchedulerDb;
use crate::tasks::{ExecutionLog, RunStatus, TaskDefinition, TaskId};
use taskdeck_core::error::Result;

/// Health record, one per task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMonitor {
    /// `None` until first saved.
    pub id: Option<i64>,
    pub task_id: TaskId,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Cached next fire estimate.
    pub next_run_at: Option<DateTime<Utc>>,
    pub current_consecutive_failures: u32,
    pub max_consecutive_failures: u32,
    pub expected_runtime_seconds: Option<u64>,
    pub is_healthy: bool,
    pub health_check_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskMonitor {
    pub fn new(
        task_id: TaskId,
        max_consecutive_failures: u32,
        expected_runtime_seconds: Option<u64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            task_id,
            last_success_at: None,
            last_failure_at: None,
            next_run_at: None,
            current_consecutive_failures: 0,
            max_consecutive_failures,
            expected_runtime_seconds,
            is_healthy: true,
            health_check_message: None,
            updated_at: now,
        }
    }

    /// Re-evaluate the health invariant against the latest closed run's
    /// duration. Sets `is_healthy` and `health_check_message`.
    pub fn evaluate(&mut self, last_duration_seconds: Option<i64>) -> bool {
        let failures = self.current_consecutive_failures;
        let threshold = self.max_consecutive_failures;
        if failures >= threshold {
            self.is_healthy = false;
            self.health_check_message =
                Some(format!("{failures} consecutive failures (threshold {threshold})"));
            return false;
        }
        if let (Some(duration), Some(expected)) = (last_duration_seconds, self.expected_runtime_seconds) {
            if expected > 0 && duration > 0 && duration as u64 > expected.saturating_mul(2) {
                self.is_healthy = false;
                self.health_check_message = Some(format!(
                    "last run took {duration}s, more than twice the expected {expected}s"
                ));
                return false;
            }
        }
        self.is_healthy = true;
        self.health_check_message = None;
        true
    }

    /// Fold one finished run into the record.
    pub fn record_outcome(
        &mut self,
        status: RunStatus,
        now: DateTime<Utc>,
        last_duration_seconds: Option<i64>,
        next_run: Option<DateTime<Utc>>,
    ) {
        match status {
            RunStatus::Success => {
                self.current_consecutive_failures = 0;
                self.last_success_at = Some(now);
                self.evaluate(last_duration_seconds);
            }
            RunStatus::Failed | RunStatus::TimedOut => {
                self.current_consecutive_failures = self.current_consecutive_failures.saturating_add(1);
                self.last_failure_at = Some(now);
                self.evaluate(last_duration_seconds);
            }
            RunStatus::Pending | RunStatus::Running => {}
        }
        self.next_run_at = next_run;
        self.updated_at = now;
    }
}

/// Result of folding an outcome into the stored monitor.
#[derive(Debug, Clone)]
pub struct MonitorUpdate {
    pub monitor: TaskMonitor,
    /// Health went from healthy to unhealthy with this outcome.
    pub became_unhealthy: bool,
}

/// Stored monitor for `task`, or a fresh one seeded from the task.
pub fn load_or_init(db: &SchedulerDb, task: &TaskDefinition, max_failures: u32) -> Result<TaskMonitor> {
    Ok(match db.get_monitor(task.id)? {
        Some(monitor) => monitor,
        None => TaskMonitor::new(task.id, max_failures, task.max_runtime_seconds, Utc::now()),
    })
}

/// Create or refresh the monitor after a task is created or edited.
pub fn initialize(db: &SchedulerDb, task: &TaskDefinition, max_failures: u32) -> Result<TaskMonitor> {
    let now = Utc::now();
    let mut monitor = load_or_init(db, task, max_failures)?;
    if task.max_runtime_seconds.is_some() {
        monitor.expected_runtime_seconds = task.max_runtime_seconds;
    }
    monitor.next_run_at = task.next_fire_time(now);
    monitor.updated_at = now;
    monitor.id = Some(db.save_monitor(&monitor)?);
    Ok(monitor)
}

/// Persisted form of [`TaskMonitor::record_outcome`] for the run that
/// `closed` records.
pub fn record_outcome(
    db: &SchedulerDb,
    task: &TaskDefinition,
    closed: &ExecutionLog,
    max_failures: u32,
) -> Result<MonitorUpdate> {
    let now = Utc::now();
    let mut monitor = load_or_init(db, task, max_failures)?;
    let was_healthy = monitor.is_healthy;

    monitor.record_outcome(closed.status, now, closed.duration_seconds, task.next_fire_time(now));
    monitor.id = Some(db.save_monitor(&monitor)?);

    if !monitor.is_healthy {
        tracing::warn!(
            "⚠️ Task {} ('{}') unhealthy: {}",
            task.id,
            task.name,
            monitor.health_check_message.as_deref().unwrap_or("")
        );
    }
    Ok(MonitorUpdate {
        became_unhealthy: was_healthy && !monitor.is_healthy,
        monitor,
    })
}

/// Re-evaluate and persist health without a new run.
pub fn check_health(db: &SchedulerDb, task: &TaskDefinition, max_failures: u32) -> Result<bool> {
    let now = Utc::now();
    let mut monitor = load_or_init(db, task, max_failures)?;
    let last_duration = db.latest_closed_log(task.id)?.and_then(|log| log.duration_seconds);
    let healthy = monitor.evaluate(last_duration);
    monitor.next_run_at = task.next_fire_time(now);
    monitor.updated_at = now;
    db.save_monitor(&monitor)?;
    Ok(healthy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{self, LogClosure};
    use crate::tasks::{NewTask, TriggeredBy};

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn failed_run(db: &SchedulerDb, task: &TaskDefinition) -> ExecutionLog {
        let log = history::open(db, task.id, TriggeredBy::Schedule, None).unwrap();
        history::close(db, log.id, LogClosure::failure(RunStatus::Failed, "boom", String::new()), 64).unwrap()
    }

    #[test]
    fn test_failures_reach_threshold() {
        let mut monitor = TaskMonitor::new(1, 3, None, now());
        monitor.record_outcome(RunStatus::Failed, now(), None, None);
        monitor.record_outcome(RunStatus::TimedOut, now(), None, None);
        assert!(monitor.is_healthy);
        monitor.record_outcome(RunStatus::Failed, now(), None, None);
        assert!(!monitor.is_healthy);
        let message = monitor.health_check_message.clone().unwrap();
        assert!(message.contains('3'), "{message}");
        assert!(monitor.last_failure_at.is_some());
    }

    #[test]
    fn test_success_resets() {
        let mut monitor = TaskMonitor::new(1, 2, None, now());
        monitor.record_outcome(RunStatus::Failed, now(), None, None);
        monitor.record_outcome(RunStatus::Failed, now(), None, None);
        assert!(!monitor.is_healthy);

        let next = now() + chrono::Duration::minutes(5);
        monitor.record_outcome(RunStatus::Success, now(), Some(1), Some(next));
        assert!(monitor.is_healthy);
        assert_eq!(monitor.current_consecutive_failures, 0);
        assert!(monitor.health_check_message.is_none());
        assert_eq!(monitor.next_run_at, Some(next));
    }

    #[test]
    fn test_slow_run_is_unhealthy() {
        let mut monitor = TaskMonitor::new(1, 3, Some(10), now());
        assert!(monitor.evaluate(Some(20)));
        assert!(!monitor.evaluate(Some(21)));
        assert!(monitor.health_check_message.unwrap().contains("21s"));
        // Unknown baseline never trips the duration clause.
        let mut open_ended = TaskMonitor::new(1, 3, None, now());
        assert!(open_ended.evaluate(Some(10_000)));
    }

    #[test]
    fn test_persisted_outcome_and_flip() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let mut new = NewTask::command("Sync", "sync:run", "*/5 * * * *");
        new.max_runtime_seconds = Some(60);
        let task = db.insert_task(&new, now()).unwrap();

        let first = record_outcome(&db, &task, &failed_run(&db, &task), 2).unwrap();
        assert!(!first.became_unhealthy);
        assert_eq!(first.monitor.expected_runtime_seconds, Some(60));
        assert!(first.monitor.next_run_at.is_some());

        let second = record_outcome(&db, &task, &failed_run(&db, &task), 2).unwrap();
        assert!(second.became_unhealthy);
        let third = record_outcome(&db, &task, &failed_run(&db, &task), 2).unwrap();
        assert!(!third.became_unhealthy);

        let stored = db.get_monitor(task.id).unwrap().unwrap();
        assert_eq!(stored.current_consecutive_failures, 3);
        assert!(!stored.is_healthy);
        assert_eq!(stored.id, second.monitor.id);
    }

    #[test]
    fn test_check_health_is_idempotent() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let task = db
            .insert_task(&NewTask::command("Sync", "sync:run", "*/5 * * * *"), now())
            .unwrap();
        let log = history::open(&db, task.id, TriggeredBy::Schedule, None).unwrap();
        history::close(&db, log.id, LogClosure::success(String::new()), 64).unwrap();

        assert!(check_health(&db, &task, 3).unwrap());
        assert!(check_health(&db, &task, 3).unwrap());
        let stored = db.get_monitor(task.id).unwrap().unwrap();
        assert!(stored.is_healthy);
        assert_eq!(stored.current_consecutive_failures, 0);
    }

    #[test]
    fn test_outcome_uses_duration_of_its_own_run() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let mut new = NewTask::command("Sync", "sync:run", "*/5 * * * *");
        new.max_runtime_seconds = Some(10);
        let task = db.insert_task(&new, now()).unwrap();

        // Two overlapping runs; the one started later was slow.
        let quick = history::open(&db, task.id, TriggeredBy::Schedule, None).unwrap();
        let slow = history::open(&db, task.id, TriggeredBy::Manual, None).unwrap();
        let finished = slow.started_at + chrono::Duration::seconds(90);
        db.finish_log(slow.id, finished, 90, &LogClosure::success(String::new())).unwrap();
        let quick = history::close(&db, quick.id, LogClosure::success(String::new()), 64).unwrap();

        let update = record_outcome(&db, &task, &quick, 3).unwrap();
        assert!(update.monitor.is_healthy, "{:?}", update.monitor.health_check_message);

        let slow = db.get_log(slow.id).unwrap().unwrap();
        let update = record_outcome(&db, &task, &slow, 3).unwrap();
        assert!(!update.monitor.is_healthy);
        assert!(update.monitor.health_check_message.unwrap().contains("90s"));
    }
}
