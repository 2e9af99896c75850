//! Task definitions and execution records: the core data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cron::{self, CronSchedule};
use taskdeck_core::error::{Result, TaskdeckError};

pub type TaskId = i64;
pub type LogId = i64;

/// Ordered argument name → value pairs passed to a task's action.
pub type TaskParameters = Vec<(String, serde_json::Value)>;

/// How a task's `action` string is interpreted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// A shell-style command line.
    Command,
    /// Identifier of a registered unit-of-work type.
    UnitOfWork,
    /// Name of a built-in maintenance action. System tasks only.
    InlineScript,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Command => "command",
            TaskKind::UnitOfWork => "unit_of_work",
            TaskKind::InlineScript => "inline_script",
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = TaskdeckError;

    fn from_str(tag: &str) -> Result<Self> {
        match tag.trim() {
            "command" => Ok(TaskKind::Command),
            "unit_of_work" | "job" => Ok(TaskKind::UnitOfWork),
            "inline_script" | "closure" => Ok(TaskKind::InlineScript),
            other => Err(TaskdeckError::validation(format!("Unknown task kind: '{other}'"))),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form classification. Informational only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Backup,
    Maintenance,
    Report,
    Sync,
    Cleanup,
    Notification,
    Other,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Backup => "backup",
            TaskCategory::Maintenance => "maintenance",
            TaskCategory::Report => "report",
            TaskCategory::Sync => "sync",
            TaskCategory::Cleanup => "cleanup",
            TaskCategory::Notification => "notification",
            TaskCategory::Other => "other",
        }
    }

    /// Unknown tags map to `Other`.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim() {
            "backup" => TaskCategory::Backup,
            "maintenance" => TaskCategory::Maintenance,
            "report" => TaskCategory::Report,
            "sync" => TaskCategory::Sync,
            "cleanup" => TaskCategory::Cleanup,
            "notification" => TaskCategory::Notification,
            _ => TaskCategory::Other,
        }
    }
}

/// A named, schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: TaskId,
    /// Human-readable label.
    pub name: String,
    /// Interpreted according to `kind`.
    pub action: String,
    pub kind: TaskKind,
    /// 5-field cron expression.
    pub schedule_expression: String,
    /// IANA zone used for every fire-time computation of this task.
    pub timezone: String,
    pub description: Option<String>,
    pub parameters: TaskParameters,
    pub is_active: bool,
    /// System tasks cannot be deleted and may run inline scripts.
    pub is_system: bool,
    /// Recipient named in health alerts.
    pub notification_email: Option<String>,
    /// Execution timeout when present.
    pub max_runtime_seconds: Option<u64>,
    pub prevent_overlap: bool,
    pub run_in_background: bool,
    pub category: TaskCategory,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when soft-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TaskDefinition {
    /// Parse this task's fire rule.
    pub fn schedule(&self) -> Result<CronSchedule> {
        CronSchedule::parse(&self.schedule_expression, &self.timezone)
    }

    /// Next fire instant strictly after `now`.
    ///
    /// `None` for inactive tasks and for unparsable expressions or timezones;
    /// display and monitoring paths call this and must not fail on bad rows.
    pub fn next_fire_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_active {
            return None;
        }
        match self.schedule() {
            Ok(schedule) => schedule.next_after(now),
            Err(e) => {
                tracing::warn!("⚠️ Task {} ('{}') has no next run: {e}", self.id, self.name);
                None
            }
        }
    }

    /// Most recent fire instant at or before `now`.
    pub fn previous_fire_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule().ok()?.previous_at_or_before(now)
    }

    /// Every fire instant in `[start, end)`.
    pub fn fire_times_within(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        match self.schedule() {
            Ok(schedule) => schedule.fires_between(start, end),
            Err(_) => Vec::new(),
        }
    }

    /// Fire instants during the current calendar day in the task's timezone.
    pub fn today_runs(&self, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.day_runs(now, 0)
    }

    /// Fire instants during the next calendar day in the task's timezone.
    pub fn tomorrow_runs(&self, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.day_runs(now, 1)
    }

    fn day_runs(&self, now: DateTime<Utc>, offset_days: i64) -> Vec<DateTime<Utc>> {
        if !self.is_active {
            return Vec::new();
        }
        let Ok(schedule) = self.schedule() else {
            return Vec::new();
        };
        match cron::day_window(schedule.timezone(), now, offset_days) {
            Some((start, end)) => schedule.fires_between(start, end),
            None => Vec::new(),
        }
    }

    /// Runtime ceiling for one invocation.
    pub fn timeout(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.max_runtime_seconds.unwrap_or(default_secs))
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Human-readable schedule label.
    pub fn describe_schedule(&self) -> String {
        cron::describe_expression(&self.schedule_expression)
    }
}

/// Input for creating a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub action: String,
    pub kind: TaskKind,
    pub schedule_expression: String,
    pub timezone: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: TaskParameters,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub notification_email: Option<String>,
    #[serde(default)]
    pub max_runtime_seconds: Option<u64>,
    #[serde(default = "default_true")]
    pub prevent_overlap: bool,
    #[serde(default)]
    pub run_in_background: bool,
    #[serde(default = "default_category")]
    pub category: TaskCategory,
}

fn default_true() -> bool {
    true
}

fn default_category() -> TaskCategory {
    TaskCategory::Other
}

impl NewTask {
    /// A task with defaults: active, UTC, overlap prevented, foreground.
    pub fn new(name: &str, kind: TaskKind, action: &str, expression: &str) -> Self {
        Self {
            name: name.to_string(),
            action: action.to_string(),
            kind,
            schedule_expression: expression.to_string(),
            timezone: "UTC".into(),
            description: None,
            parameters: Vec::new(),
            is_active: true,
            is_system: false,
            notification_email: None,
            max_runtime_seconds: None,
            prevent_overlap: true,
            run_in_background: false,
            category: TaskCategory::Other,
        }
    }

    /// Shorthand for a command task.
    pub fn command(name: &str, command: &str, expression: &str) -> Self {
        Self::new(name, TaskKind::Command, command, expression)
    }

    /// Field-level checks that need no storage access.
    pub fn validate(&self) -> Result<()> {
        validate_fields(
            &self.name,
            &self.action,
            self.kind,
            &self.schedule_expression,
            &self.timezone,
            self.max_runtime_seconds,
            self.is_system,
        )
    }
}

/// Partial update for an existing task. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub action: Option<String>,
    pub kind: Option<TaskKind>,
    pub schedule_expression: Option<String>,
    pub timezone: Option<String>,
    pub description: Option<Option<String>>,
    pub parameters: Option<TaskParameters>,
    pub is_active: Option<bool>,
    pub notification_email: Option<Option<String>>,
    pub max_runtime_seconds: Option<Option<u64>>,
    pub prevent_overlap: Option<bool>,
    pub run_in_background: Option<bool>,
    pub category: Option<TaskCategory>,
}

impl TaskUpdate {
    /// Apply onto `task` and validate the result.
    pub fn apply(self, task: &mut TaskDefinition) -> Result<()> {
        if let Some(v) = self.name {
            task.name = v;
        }
        if let Some(v) = self.action {
            task.action = v;
        }
        if let Some(v) = self.kind {
            task.kind = v;
        }
        if let Some(v) = self.schedule_expression {
            task.schedule_expression = v;
        }
        if let Some(v) = self.timezone {
            task.timezone = v;
        }
        if let Some(v) = self.description {
            task.description = v;
        }
        if let Some(v) = self.parameters {
            task.parameters = v;
        }
        if let Some(v) = self.is_active {
            task.is_active = v;
        }
        if let Some(v) = self.notification_email {
            task.notification_email = v;
        }
        if let Some(v) = self.max_runtime_seconds {
            task.max_runtime_seconds = v;
        }
        if let Some(v) = self.prevent_overlap {
            task.prevent_overlap = v;
        }
        if let Some(v) = self.run_in_background {
            task.run_in_background = v;
        }
        if let Some(v) = self.category {
            task.category = v;
        }
        validate_fields(
            &task.name,
            &task.action,
            task.kind,
            &task.schedule_expression,
            &task.timezone,
            task.max_runtime_seconds,
            task.is_system,
        )
    }
}

fn validate_fields(
    name: &str,
    action: &str,
    kind: TaskKind,
    expression: &str,
    timezone: &str,
    max_runtime_seconds: Option<u64>,
    is_system: bool,
) -> Result<()> {
    if name.trim().is_empty() {
        return Err(TaskdeckError::validation("Task name is required"));
    }
    if action.trim().is_empty() {
        return Err(TaskdeckError::validation("Task action is required"));
    }
    // Surfaces the precise parse error for the expression or the timezone.
    CronSchedule::parse(expression, timezone)?;
    if max_runtime_seconds == Some(0) {
        return Err(TaskdeckError::validation("max_runtime_seconds must be greater than 0"));
    }
    if kind == TaskKind::InlineScript && !is_system {
        return Err(TaskdeckError::validation(
            "Inline scripts are only allowed on system tasks",
        ));
    }
    Ok(())
}

/// Status of one run attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    TimedOut,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timeout",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "timeout" | "timed_out" => Ok(RunStatus::TimedOut),
            other => Err(TaskdeckError::validation(format!("Unknown run status: '{other}'"))),
        }
    }

    /// Success, Failed and TimedOut cannot be left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed | RunStatus::TimedOut)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::TimedOut)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Schedule,
    Manual,
    Api,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggeredBy::Schedule => "schedule",
            TriggeredBy::Manual => "manual",
            TriggeredBy::Api => "api",
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "manual" => TriggeredBy::Manual,
            "api" => TriggeredBy::Api,
            _ => TriggeredBy::Schedule,
        }
    }
}

/// One run attempt of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: LogId,
    pub task_id: TaskId,
    pub started_at: DateTime<Utc>,
    /// `None` while running.
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub status: RunStatus,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub memory_usage_bytes: Option<i64>,
    pub triggered_by: TriggeredBy,
    pub triggering_user: Option<i64>,
}

impl ExecutionLog {
    pub fn is_closed(&self) -> bool {
        self.finished_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn sample_task(expression: &str) -> TaskDefinition {
        let now = Utc::now();
        TaskDefinition {
            id: 1,
            name: "sample".into(),
            action: "cache:warmup".into(),
            kind: TaskKind::Command,
            schedule_expression: expression.into(),
            timezone: "UTC".into(),
            description: None,
            parameters: Vec::new(),
            is_active: true,
            is_system: false,
            notification_email: None,
            max_runtime_seconds: None,
            prevent_overlap: true,
            run_in_background: false,
            category: TaskCategory::Maintenance,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn test_next_fire_time_scenario() {
        let task = sample_task("*/5 * * * *");
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 2, 0).unwrap();
        assert_eq!(
            task.next_fire_time(now),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap())
        );
    }

    #[test]
    fn test_next_fire_time_strictly_after_now() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 7, 30, 0).unwrap();
        for expr in ["* * * * *", "30 7 * * *", "0 0 1 1 *", "*/15 * * * 1-5"] {
            let task = sample_task(expr);
            let next = task.next_fire_time(now).unwrap();
            assert!(next > now, "{expr} gave {next}");
        }
    }

    #[test]
    fn test_inactive_or_broken_task_has_no_next_run() {
        let now = Utc::now();
        let mut task = sample_task("* * * * *");
        task.is_active = false;
        assert!(task.next_fire_time(now).is_none());
        assert!(task.today_runs(now).is_empty());

        let broken = sample_task("not a cron");
        assert!(broken.next_fire_time(now).is_none());
        assert!(broken.fire_times_within(now, now + chrono::Duration::hours(1)).is_empty());
    }

    #[test]
    fn test_today_and_tomorrow_runs() {
        let task = sample_task("0 */6 * * *");
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert_eq!(task.today_runs(now).len(), 4);
        let tomorrow = task.tomorrow_runs(now);
        assert_eq!(tomorrow.len(), 4);
        assert_eq!(tomorrow[0], Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!("job".parse::<TaskKind>().unwrap(), TaskKind::UnitOfWork);
        assert_eq!("closure".parse::<TaskKind>().unwrap(), TaskKind::InlineScript);
        assert!("lambda".parse::<TaskKind>().is_err());
    }

    #[test]
    fn test_new_task_validation() {
        assert!(NewTask::command("backup", "backup:run", "0 3 * * *").validate().is_ok());
        assert!(NewTask::command("backup", "backup:run", "* * * *").validate().is_err());
        assert!(NewTask::command("", "backup:run", "0 3 * * *").validate().is_err());

        let mut bad_tz = NewTask::command("backup", "backup:run", "0 3 * * *");
        bad_tz.timezone = "Nowhere/City".into();
        assert!(bad_tz.validate().is_err());

        let script = NewTask::new("prune", TaskKind::InlineScript, "prune-execution-logs", "0 4 * * *");
        assert!(matches!(script.validate(), Err(TaskdeckError::Validation(_))));
    }

    #[test]
    fn test_update_revalidates() {
        let mut task = sample_task("0 3 * * *");
        let update = TaskUpdate {
            schedule_expression: Some("99 * * * *".into()),
            ..Default::default()
        };
        assert!(update.apply(&mut task).is_err());

        let mut task = sample_task("0 3 * * *");
        let update = TaskUpdate {
            run_in_background: Some(true),
            max_runtime_seconds: Some(Some(120)),
            ..Default::default()
        };
        update.apply(&mut task).unwrap();
        assert!(task.run_in_background);
        assert_eq!(task.timeout(3600), Duration::from_secs(120));
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::TimedOut.is_terminal());
        assert!(RunStatus::TimedOut.is_failure());
        assert_eq!(RunStatus::from_tag("timeout").unwrap(), RunStatus::TimedOut);
    }
}
