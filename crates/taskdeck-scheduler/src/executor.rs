//! Task executor: one dispatch path for every task kind.
//!
//! Given a task and its open execution log, the executor runs the resolved
//! action under a timeout, closes the log exactly once, folds the outcome into
//! the health monitor and raises an alert when health flips. Failures are
//! recorded first, then returned to the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::action::{MaintenanceAction, TaskAction};
use crate::dispatch::Notifier;
use crate::history::{self, LogClosure};
use crate::jobs::JobRegistry;
use crate::monitor::{self, TaskMonitor};
use crate::notify::Notification;
use crate::persistence::{SchedulerDb, TaskFilter};
use crate::runner::CommandRunner;
use crate::tasks::{ExecutionLog, LogId, RunStatus, TaskDefinition, TaskParameters};
use taskdeck_core::config::SchedulerConfig;
use taskdeck_core::error::{Result, TaskdeckError};

/// Knobs the executor reads from `[scheduler]`.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub default_timeout_secs: u64,
    pub output_limit_bytes: usize,
    pub max_consecutive_failures: u32,
    pub log_retention_days: u32,
}

impl From<&SchedulerConfig> for ExecutorSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            default_timeout_secs: config.default_timeout_secs,
            output_limit_bytes: config.output_limit_bytes,
            max_consecutive_failures: config.max_consecutive_failures,
            log_retention_days: config.log_retention_days,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

/// Why an action failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The command exited nonzero (`None` = killed by a signal).
    NonZeroExit(Option<i32>),
    /// The action returned or raised an error.
    Raised,
    /// The runtime ceiling was hit.
    TimedOut,
    /// The action could not be resolved.
    Rejected,
}

/// Result of running an action, before anything is persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Succeeded { output: String },
    Failed { kind: FailureKind, message: String, output: String },
}

impl ActionOutcome {
    fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        ActionOutcome::Failed { kind, message: message.into(), output: String::new() }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            ActionOutcome::Succeeded { .. } => RunStatus::Success,
            ActionOutcome::Failed { kind: FailureKind::TimedOut, .. } => RunStatus::TimedOut,
            ActionOutcome::Failed { .. } => RunStatus::Failed,
        }
    }

    fn closure(&self) -> LogClosure {
        match self {
            ActionOutcome::Succeeded { output } => LogClosure::success(output.clone()),
            ActionOutcome::Failed { message, output, .. } => {
                LogClosure::failure(self.status(), message.clone(), output.clone())
            }
        }
    }

    fn into_error(self, timeout: Duration) -> Option<TaskdeckError> {
        match self {
            ActionOutcome::Succeeded { .. } => None,
            ActionOutcome::Failed { kind: FailureKind::TimedOut, .. } => {
                Some(TaskdeckError::TimedOut(timeout.as_secs()))
            }
            ActionOutcome::Failed { message, .. } => Some(TaskdeckError::Execution(message)),
        }
    }
}

/// What a successful run leaves behind.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub log: ExecutionLog,
    pub monitor: TaskMonitor,
    pub elapsed: Duration,
}

/// Runs tasks. Cheap to clone; workers each hold one.
#[derive(Clone)]
pub struct TaskExecutor {
    db: Arc<SchedulerDb>,
    commands: Arc<dyn CommandRunner>,
    jobs: Arc<JobRegistry>,
    notifier: Arc<Notifier>,
    settings: ExecutorSettings,
}

impl TaskExecutor {
    pub fn new(
        db: Arc<SchedulerDb>,
        commands: Arc<dyn CommandRunner>,
        jobs: Arc<JobRegistry>,
        notifier: Arc<Notifier>,
        settings: ExecutorSettings,
    ) -> Self {
        Self { db, commands, jobs, notifier, settings }
    }

    pub fn db(&self) -> &Arc<SchedulerDb> {
        &self.db
    }

    pub fn commands(&self) -> &Arc<dyn CommandRunner> {
        &self.commands
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Run `task` against its open `log`.
    pub async fn execute(&self, task: &TaskDefinition, log: ExecutionLog) -> Result<ExecutionSummary> {
        let started = Instant::now();
        let rss_before = resident_bytes();
        let mut guard = RunGuard::arm(self, task, log.id);
        let timeout = task.timeout(self.settings.default_timeout_secs);

        tracing::info!("▶️ Task {} ('{}') started, log {}", task.id, task.name, log.id);
        let outcome = match TaskAction::resolve(task) {
            Err(e) => ActionOutcome::failed(FailureKind::Rejected, e.to_string()),
            Ok(action) => match tokio::time::timeout(timeout, self.perform(&action)).await {
                Ok(outcome) => outcome,
                Err(_) => ActionOutcome::failed(
                    FailureKind::TimedOut,
                    format!("timed out after {}s", timeout.as_secs()),
                ),
            },
        };
        let elapsed = started.elapsed();
        let memory = match (rss_before, resident_bytes()) {
            (Some(before), Some(after)) => Some((after - before).max(0)),
            _ => None,
        };

        // The guard stays armed until the close lands.
        let closed = match history::close(
            &self.db,
            log.id,
            outcome.closure().with_memory(memory),
            self.settings.output_limit_bytes,
        ) {
            Ok(closed) => closed,
            Err(e) => {
                tracing::error!("❌ Could not record result of task {} in log {}: {e}", task.id, log.id);
                return Err(e);
            }
        };
        guard.disarm();
        let update = monitor::record_outcome(
            &self.db,
            task,
            &closed,
            self.settings.max_consecutive_failures,
        )?;
        if update.became_unhealthy {
            self.notifier
                .send(Notification::task_unhealthy(task, &update.monitor))
                .await;
        }

        match outcome.into_error(timeout) {
            None => {
                tracing::info!(
                    "✅ Task {} ('{}') succeeded in {:.1}s",
                    task.id,
                    task.name,
                    elapsed.as_secs_f64()
                );
                Ok(ExecutionSummary { log: closed, monitor: update.monitor, elapsed })
            }
            Some(err) => {
                tracing::error!("❌ Task {} ('{}') failed: {err}", task.id, task.name);
                Err(err)
            }
        }
    }

    async fn perform(&self, action: &TaskAction) -> ActionOutcome {
        match action {
            TaskAction::Command { command, arguments } => {
                match self.commands.run(command, arguments).await {
                    Ok(out) if out.success() => ActionOutcome::Succeeded { output: out.combined() },
                    Ok(out) => ActionOutcome::Failed {
                        kind: FailureKind::NonZeroExit(out.exit_code),
                        message: match out.exit_code {
                            Some(code) => format!("command exited with code {code}"),
                            None => "command terminated by signal".to_string(),
                        },
                        output: out.combined(),
                    },
                    Err(e) => ActionOutcome::failed(FailureKind::Raised, e.to_string()),
                }
            }
            TaskAction::UnitOfWork { type_id, arguments } => {
                let job = match self.jobs.build(type_id, arguments) {
                    Ok(job) => job,
                    Err(e) => return ActionOutcome::failed(FailureKind::Raised, e.to_string()),
                };
                match job.perform().await {
                    Ok(output) => ActionOutcome::Succeeded { output },
                    Err(e) => ActionOutcome::failed(FailureKind::Raised, e.to_string()),
                }
            }
            TaskAction::Maintenance { action, parameters } => {
                match self.run_maintenance(*action, parameters) {
                    Ok(output) => ActionOutcome::Succeeded { output },
                    Err(e) => ActionOutcome::failed(FailureKind::Raised, e.to_string()),
                }
            }
        }
    }

    fn run_maintenance(&self, action: MaintenanceAction, parameters: &TaskParameters) -> Result<String> {
        match action {
            MaintenanceAction::PruneExecutionLogs => {
                let days = parameters
                    .iter()
                    .find(|(name, _)| name == "days")
                    .and_then(|(_, v)| v.as_u64())
                    .map(|d| d.min(u64::from(u32::MAX)) as u32)
                    .unwrap_or(self.settings.log_retention_days);
                let removed = history::prune_logs(&self.db, days)?;
                Ok(format!("pruned {removed} execution logs older than {days} days"))
            }
            MaintenanceAction::RefreshHealth => {
                let tasks = self.db.list_tasks(&TaskFilter::default())?;
                let mut unhealthy = 0;
                for task in &tasks {
                    if !monitor::check_health(&self.db, task, self.settings.max_consecutive_failures)? {
                        unhealthy += 1;
                    }
                }
                Ok(format!("checked {} tasks, {unhealthy} unhealthy", tasks.len()))
            }
        }
    }
}

// ─── Run Guard ────────────────────────────────────────────────

/// Closes the log as Failed if the run ends before the executor closed it
/// itself: the future was dropped, a panic unwound, or the close failed.
struct RunGuard {
    db: Arc<SchedulerDb>,
    task: TaskDefinition,
    log_id: LogId,
    output_limit: usize,
    max_failures: u32,
    armed: bool,
}

impl RunGuard {
    fn arm(executor: &TaskExecutor, task: &TaskDefinition, log_id: LogId) -> Self {
        Self {
            db: Arc::clone(&executor.db),
            task: task.clone(),
            log_id,
            output_limit: executor.settings.output_limit_bytes,
            max_failures: executor.settings.max_consecutive_failures,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(
            "⚠️ Task {} ('{}') interrupted, closing log {}",
            self.task.id,
            self.task.name,
            self.log_id
        );
        let closure = LogClosure::failure(
            RunStatus::Failed,
            "execution interrupted before completion",
            String::new(),
        );
        match history::close(&self.db, self.log_id, closure, self.output_limit) {
            Ok(closed) => {
                if let Err(e) = monitor::record_outcome(&self.db, &self.task, &closed, self.max_failures) {
                    tracing::warn!("⚠️ Monitor update failed for task {}: {e}", self.task.id);
                }
            }
            Err(TaskdeckError::LogAlreadyClosed(_)) => {}
            Err(e) => tracing::error!("❌ Could not close log {}: {e}", self.log_id),
        }
    }
}

/// Resident set size of this process (Linux only).
fn resident_bytes() -> Option<i64> {
    const PAGE_SIZE: i64 = 4096;
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: i64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * PAGE_SIZE)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::jobs::UnitOfWork;
    use crate::runner::CommandOutput;
    use crate::tasks::{NewTask, TaskKind, TriggeredBy};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Command runner double: fixed exit code, optional delay, records calls.
    pub(crate) struct FakeRunner {
        pub exit_code: i32,
        pub delay: Duration,
        pub calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl FakeRunner {
        pub(crate) fn exiting(exit_code: i32) -> Self {
            Self { exit_code, delay: Duration::ZERO, calls: Mutex::new(Vec::new()) }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, command: &str, arguments: &[String]) -> Result<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((command.to_string(), arguments.to_vec()));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(CommandOutput {
                exit_code: Some(self.exit_code),
                stdout: format!("ran {command}"),
                stderr: String::new(),
            })
        }
    }

    pub(crate) fn executor_with(db: Arc<SchedulerDb>, runner: Arc<FakeRunner>) -> TaskExecutor {
        let mut jobs = JobRegistry::new();
        jobs.register("reports.fail", |_| Ok(Box::new(Failing) as Box<dyn UnitOfWork>));
        TaskExecutor::new(
            db,
            runner,
            Arc::new(jobs),
            Arc::new(Notifier::default()),
            ExecutorSettings { max_consecutive_failures: 2, ..Default::default() },
        )
    }

    struct Failing;

    #[async_trait]
    impl UnitOfWork for Failing {
        async fn perform(&self) -> Result<String> {
            Err(TaskdeckError::Execution("report source offline".into()))
        }
    }

    fn insert(db: &SchedulerDb, new: NewTask) -> TaskDefinition {
        db.insert_task(&new, chrono::Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn test_success_closes_log_and_resets_monitor() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let runner = Arc::new(FakeRunner::exiting(0));
        let executor = executor_with(db.clone(), runner.clone());
        let mut new = NewTask::command("Warmup", "cache:warmup", "*/5 * * * *");
        new.parameters = vec![("force".into(), serde_json::json!(true))];
        let task = insert(&db, new);

        let log = history::open(&db, task.id, TriggeredBy::Schedule, None).unwrap();
        let summary = executor.execute(&task, log).await.unwrap();
        assert_eq!(summary.log.status, RunStatus::Success);
        assert_eq!(summary.log.output.as_deref(), Some("ran cache:warmup"));
        assert!(summary.monitor.is_healthy);
        assert_eq!(runner.calls.lock().unwrap()[0].1, vec!["--force".to_string()]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_records_one_failed_log() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let executor = executor_with(db.clone(), Arc::new(FakeRunner::exiting(3)));
        let task = insert(&db, NewTask::command("Sync", "sync:run", "0 * * * *"));

        let log = history::open(&db, task.id, TriggeredBy::Schedule, None).unwrap();
        let err = executor.execute(&task, log).await.unwrap_err();
        assert!(matches!(err, TaskdeckError::Execution(ref m) if m.contains("code 3")));

        let logs = db.logs_for_task(task.id, 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, RunStatus::Failed);
        assert!(logs[0].finished_at.is_some());
        assert!(logs[0].duration_seconds.unwrap() >= 0);
    }

    #[tokio::test]
    async fn test_timeout_closes_as_timed_out() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let runner = Arc::new(FakeRunner {
            exit_code: 0,
            delay: Duration::from_secs(5),
            calls: Mutex::new(Vec::new()),
        });
        let executor = executor_with(db.clone(), runner);
        let mut new = NewTask::command("Slow", "slow:run", "0 * * * *");
        new.max_runtime_seconds = Some(1);
        let task = insert(&db, new);

        let log = history::open(&db, task.id, TriggeredBy::Manual, None).unwrap();
        let err = executor.execute(&task, log).await.unwrap_err();
        assert!(matches!(err, TaskdeckError::TimedOut(1)));
        assert_eq!(db.latest_log(task.id).unwrap().unwrap().status, RunStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_unit_of_work_failures_make_task_unhealthy() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let executor = executor_with(db.clone(), Arc::new(FakeRunner::exiting(0)));
        let task = insert(&db, NewTask::new("Report", TaskKind::UnitOfWork, "reports.fail", "0 9 * * *"));

        for _ in 0..2 {
            let log = history::open(&db, task.id, TriggeredBy::Schedule, None).unwrap();
            assert!(executor.execute(&task, log).await.is_err());
        }
        let monitor = db.get_monitor(task.id).unwrap().unwrap();
        assert!(!monitor.is_healthy);
        assert!(monitor.health_check_message.unwrap().contains("2 consecutive failures"));
    }

    #[tokio::test]
    async fn test_dropped_run_is_closed_as_failed() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let runner = Arc::new(FakeRunner {
            exit_code: 0,
            delay: Duration::from_secs(30),
            calls: Mutex::new(Vec::new()),
        });
        let executor = executor_with(db.clone(), runner);
        let task = insert(&db, NewTask::command("Hang", "hang:run", "0 * * * *"));
        let log = history::open(&db, task.id, TriggeredBy::Schedule, None).unwrap();
        let log_id = log.id;

        let run = executor.execute(&task, log);
        let abandoned = tokio::time::timeout(Duration::from_millis(50), run).await;
        assert!(abandoned.is_err());

        let stored = db.get_log(log_id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("execution interrupted before completion"));
        assert!(db.open_logs(task.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_maintenance_prune() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let executor = executor_with(db.clone(), Arc::new(FakeRunner::exiting(0)));
        let mut new = NewTask::new("Prune", TaskKind::InlineScript, "prune-execution-logs", "0 4 * * *");
        new.is_system = true;
        new.parameters = vec![("days".into(), serde_json::json!(7))];
        let task = insert(&db, new);

        let log = history::open(&db, task.id, TriggeredBy::Schedule, None).unwrap();
        let summary = executor.execute(&task, log).await.unwrap();
        assert!(summary.log.output.unwrap().contains("older than 7 days"));
    }

    #[tokio::test]
    async fn test_failed_close_still_closes_log_as_failed() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let executor = executor_with(db.clone(), Arc::new(FakeRunner::exiting(0)));
        let task = insert(&db, NewTask::command("Flaky store", "store:run", "0 * * * *"));
        db.execute_sql(
            "CREATE TRIGGER reject_success BEFORE UPDATE ON scheduled_task_logs
             WHEN NEW.status = 'success'
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
        )
        .unwrap();

        let log = history::open(&db, task.id, TriggeredBy::Schedule, None).unwrap();
        let log_id = log.id;
        let err = executor.execute(&task, log).await.unwrap_err();
        assert!(matches!(err, TaskdeckError::Database(_)), "{err:?}");

        let stored = db.get_log(log_id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert!(stored.finished_at.is_some());
        assert!(db.open_logs(task.id).unwrap().is_empty());
        let monitor = db.get_monitor(task.id).unwrap().unwrap();
        assert_eq!(monitor.current_consecutive_failures, 1);
    }
}
