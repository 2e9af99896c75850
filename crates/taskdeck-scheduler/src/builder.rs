//! Schedule builder: turns active task definitions (and static entries from
//! config) into named events for the host scheduler.
//!
//! Events carry the task id only. Everything else about the task is re-read
//! when the event fires, so edits and deactivations take effect without a
//! rebuild.

use std::sync::Arc;
use std::time::Duration;

use crate::cron::CronSchedule;
use crate::registry::TaskRegistry;
use crate::tasks::{TaskDefinition, TaskId};
use taskdeck_core::config::{SchedulerConfig, StaticEntryConfig};
use taskdeck_core::error::TaskdeckError;

/// What an event runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSource {
    /// A database task, re-fetched at fire time.
    Task { task_id: TaskId },
    /// A command declared in config.
    Static { command: String },
}

/// A registered, fireable event.
#[derive(Debug)]
pub struct ScheduledEvent {
    /// Stable across rebuilds; the host deduplicates on it.
    pub name: String,
    pub source: EventSource,
    pub schedule: CronSchedule,
    pub prevent_overlap: bool,
    pub run_in_background: bool,
    /// Lease lifetime for overlap prevention.
    pub lease_ttl: Duration,
}

/// Event name for a database task.
pub fn task_event_name(task_id: TaskId) -> String {
    format!("scheduled-task:{task_id}")
}

/// Event name for a static entry.
pub fn static_event_name(name: &str) -> String {
    format!("static:{name}")
}

/// Receives events from a build.
pub trait EventSink {
    fn register(&mut self, event: ScheduledEvent);

    /// Whether the sink can keep two runs of one event from overlapping.
    fn supports_overlap_prevention(&self) -> bool {
        true
    }

    /// Called before the first `register` of a build.
    fn begin_build(&mut self) {}

    /// Called after the last `register`. `complete` is false when the task
    /// list could not be read: task events from earlier builds must go, and
    /// only the static entries registered by this build stay.
    fn finish_build(&mut self, _complete: bool) {}
}

/// Outcome of one build.
#[derive(Debug, Default)]
pub struct BuildReport {
    /// Names of the events handed to the sink, in order.
    pub registered: Vec<String>,
    /// One `TaskdeckError::Registration` per task that was skipped.
    pub registration_errors: Vec<TaskdeckError>,
    /// Set when the task list itself could not be read.
    pub infrastructure_error: Option<TaskdeckError>,
    /// Known limitations hit during the build.
    pub warnings: Vec<String>,
}

impl BuildReport {
    pub fn is_clean(&self) -> bool {
        self.registration_errors.is_empty() && self.infrastructure_error.is_none()
    }
}

/// Builds the event set.
#[derive(Clone)]
pub struct ScheduleBuilder {
    registry: Arc<dyn TaskRegistry>,
    static_entries: Vec<StaticEntryConfig>,
    default_timeout_secs: u64,
    lease_grace_secs: u64,
}

impl ScheduleBuilder {
    pub fn new(registry: Arc<dyn TaskRegistry>) -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            registry,
            static_entries: Vec::new(),
            default_timeout_secs: defaults.default_timeout_secs,
            lease_grace_secs: defaults.lease_grace_secs,
        }
    }

    pub fn with_static_entries(mut self, entries: Vec<StaticEntryConfig>) -> Self {
        self.static_entries = entries;
        self
    }

    pub fn with_settings(mut self, config: &SchedulerConfig) -> Self {
        self.default_timeout_secs = config.default_timeout_secs;
        self.lease_grace_secs = config.lease_grace_secs;
        self
    }

    /// Register static entries and one event per active task.
    ///
    /// A bad task is logged and skipped; an unreadable registry is logged and
    /// the static entries are still registered.
    pub fn build(&self, sink: &mut dyn EventSink) -> BuildReport {
        let mut report = BuildReport::default();
        sink.begin_build();

        for entry in &self.static_entries {
            match self.static_event(entry) {
                Ok(event) => {
                    report.registered.push(event.name.clone());
                    sink.register(event);
                }
                Err(e) => {
                    tracing::error!("❌ Static entry '{}' not registered: {e}", entry.name);
                    report.registration_errors.push(e);
                }
            }
        }

        let tasks = match self.registry.active_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                let err = TaskdeckError::Infrastructure(format!("could not load active tasks: {e}"));
                tracing::error!("❌ {err}; registering static entries only");
                report.infrastructure_error = Some(err);
                sink.finish_build(false);
                return report;
            }
        };

        let overlap_supported = sink.supports_overlap_prevention();
        for task in &tasks {
            match self.task_event(task) {
                Ok(event) => {
                    if event.prevent_overlap && !overlap_supported {
                        let warning = format!(
                            "task {} ('{}') asks for overlap prevention but the scheduler cannot \
                             enforce it; runs may overlap",
                            task.id, task.name
                        );
                        tracing::warn!("⚠️ {warning}");
                        report.warnings.push(warning);
                    }
                    tracing::debug!(
                        "📅 Registered task {} ('{}') as {} [{} {}]",
                        task.id,
                        task.name,
                        event.name,
                        task.schedule_expression,
                        task.timezone
                    );
                    report.registered.push(event.name.clone());
                    sink.register(event);
                }
                Err(e) => {
                    tracing::error!("❌ {e}");
                    report.registration_errors.push(e);
                }
            }
        }

        sink.finish_build(true);
        tracing::info!(
            "📅 Schedule built: {} events, {} skipped",
            report.registered.len(),
            report.registration_errors.len()
        );
        report
    }

    fn task_event(&self, task: &TaskDefinition) -> Result<ScheduledEvent, TaskdeckError> {
        let schedule = task.schedule().map_err(|e| TaskdeckError::Registration {
            task_id: task.id,
            name: task.name.clone(),
            reason: e.to_string(),
        })?;
        let ttl = task.timeout(self.default_timeout_secs) + Duration::from_secs(self.lease_grace_secs);
        Ok(ScheduledEvent {
            name: task_event_name(task.id),
            source: EventSource::Task { task_id: task.id },
            schedule,
            prevent_overlap: task.prevent_overlap,
            run_in_background: task.run_in_background,
            lease_ttl: ttl,
        })
    }

    fn static_event(&self, entry: &StaticEntryConfig) -> Result<ScheduledEvent, TaskdeckError> {
        let schedule = CronSchedule::parse(&entry.expression, &entry.timezone).map_err(|e| {
            TaskdeckError::Registration {
                task_id: 0,
                name: entry.name.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(ScheduledEvent {
            name: static_event_name(&entry.name),
            source: EventSource::Static { command: entry.command.clone() },
            schedule,
            prevent_overlap: false,
            run_in_background: false,
            lease_ttl: Duration::from_secs(self.default_timeout_secs + self.lease_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SchedulerDb;
    use crate::tasks::NewTask;
    use chrono::Utc;
    use taskdeck_core::error::Result;

    #[derive(Default)]
    struct RecordingSink {
        events: Vec<ScheduledEvent>,
        overlap: bool,
        finished: Option<bool>,
    }

    impl EventSink for RecordingSink {
        fn register(&mut self, event: ScheduledEvent) {
            self.events.push(event);
        }
        fn supports_overlap_prevention(&self) -> bool {
            self.overlap
        }
        fn finish_build(&mut self, complete: bool) {
            self.finished = Some(complete);
        }
    }

    struct BrokenRegistry;

    impl TaskRegistry for BrokenRegistry {
        fn active_tasks(&self) -> Result<Vec<TaskDefinition>> {
            Err(TaskdeckError::Database("disk I/O error".into()))
        }
        fn find_task(&self, _id: TaskId) -> Result<Option<TaskDefinition>> {
            Ok(None)
        }
    }

    fn static_entry(name: &str, expression: &str) -> StaticEntryConfig {
        StaticEntryConfig {
            name: name.into(),
            command: "queue:snapshot".into(),
            expression: expression.into(),
            timezone: "UTC".into(),
        }
    }

    fn seeded_db() -> Arc<SchedulerDb> {
        let db = SchedulerDb::open_in_memory().unwrap();
        let now = Utc::now();
        db.insert_task(&NewTask::command("a", "a:run", "*/5 * * * *"), now).unwrap();
        let mut bg = NewTask::command("b", "b:run", "0 3 * * *");
        bg.run_in_background = true;
        bg.max_runtime_seconds = Some(120);
        db.insert_task(&bg, now).unwrap();
        Arc::new(db)
    }

    #[test]
    fn test_build_is_stable() {
        let db = seeded_db();
        let builder = ScheduleBuilder::new(db).with_static_entries(vec![static_entry("snap", "*/5 * * * *")]);
        let mut first = RecordingSink { overlap: true, ..Default::default() };
        let mut second = RecordingSink { overlap: true, ..Default::default() };
        let a = builder.build(&mut first);
        let b = builder.build(&mut second);
        assert_eq!(a.registered, b.registered);
        assert_eq!(a.registered, vec!["static:snap", "scheduled-task:1", "scheduled-task:2"]);
        assert!(a.is_clean());
        assert_eq!(first.finished, Some(true));
    }

    #[test]
    fn test_event_carries_policy() {
        let builder = ScheduleBuilder::new(seeded_db());
        let mut sink = RecordingSink { overlap: true, ..Default::default() };
        builder.build(&mut sink);
        let bg = sink.events.iter().find(|e| e.name == "scheduled-task:2").unwrap();
        assert_eq!(bg.source, EventSource::Task { task_id: 2 });
        assert!(bg.run_in_background);
        assert!(bg.prevent_overlap);
        assert_eq!(bg.lease_ttl, Duration::from_secs(120 + 60));
    }

    #[test]
    fn test_bad_row_is_skipped() {
        let db = seeded_db();
        // Simulate a row that bypassed write-time validation.
        let mut task = db.get_task(1).unwrap().unwrap();
        task.timezone = "Nowhere/City".into();
        db.update_task(&task, Utc::now()).unwrap();

        let mut sink = RecordingSink { overlap: true, ..Default::default() };
        let report = ScheduleBuilder::new(db).build(&mut sink);
        assert_eq!(report.registered, vec!["scheduled-task:2"]);
        assert_eq!(report.registration_errors.len(), 1);
        assert!(matches!(
            report.registration_errors[0],
            TaskdeckError::Registration { task_id: 1, .. }
        ));
    }

    #[test]
    fn test_registry_failure_keeps_static_entries() {
        let builder = ScheduleBuilder::new(Arc::new(BrokenRegistry))
            .with_static_entries(vec![static_entry("snap", "*/5 * * * *"), static_entry("bad", "nope")]);
        let mut sink = RecordingSink::default();
        let report = builder.build(&mut sink);
        assert_eq!(report.registered, vec!["static:snap"]);
        assert!(matches!(report.infrastructure_error, Some(TaskdeckError::Infrastructure(_))));
        assert_eq!(report.registration_errors.len(), 1);
        assert_eq!(sink.finished, Some(false));
    }

    #[test]
    fn test_overlap_limitation_is_reported() {
        let builder = ScheduleBuilder::new(seeded_db());
        let mut sink = RecordingSink { overlap: false, ..Default::default() };
        let report = builder.build(&mut sink);
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(sink.events.len(), 2);
    }
}
