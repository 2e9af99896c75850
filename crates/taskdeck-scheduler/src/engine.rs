//! Scheduler Engine: the host scheduler that owns registered events and fires
//! them. Uses tokio::interval for ticking (sleeps between checks).

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::action::TaskAction;
use crate::builder::{EventSink, EventSource, ScheduleBuilder, ScheduledEvent};
use crate::executor::TaskExecutor;
use crate::history;
use crate::lock::{Lease, OverlapGuard};
use crate::registry::TaskRegistry;
use crate::tasks::{LogId, RunStatus, TaskDefinition, TaskId, TriggeredBy};
use crate::worker::{ExecutionRequest, WorkerPool};
use taskdeck_core::error::TaskdeckError;

/// Why a fire did not start a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Deleted since the last build.
    Missing,
    /// Deactivated since the last build.
    Inactive,
    /// A previous run still holds the overlap lease.
    Overlapping,
    /// The action could not be resolved.
    Rejected(String),
}

/// What happened when an event fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// Ran inline to a terminal status.
    Completed { log_id: LogId, status: RunStatus },
    /// Handed to the worker pool.
    Queued { log_id: LogId },
    Skipped(SkipReason),
    /// Static entry finished.
    StaticCompleted { success: bool },
    /// Infrastructure problem before a run could start.
    Error(String),
}

/// The scheduler engine: holds events by name and fires the due ones.
pub struct SchedulerEngine {
    events: BTreeMap<String, ScheduledEvent>,
    seen: HashSet<String>,
    last_tick: Option<DateTime<Utc>>,
    registry: Arc<dyn TaskRegistry>,
    executor: TaskExecutor,
    overlap: Arc<dyn OverlapGuard>,
    workers: Option<Arc<WorkerPool>>,
    lease_grace: Duration,
}

impl SchedulerEngine {
    pub fn new(
        registry: Arc<dyn TaskRegistry>,
        executor: TaskExecutor,
        overlap: Arc<dyn OverlapGuard>,
        workers: Option<Arc<WorkerPool>>,
        lease_grace_secs: u64,
    ) -> Self {
        Self {
            events: BTreeMap::new(),
            seen: HashSet::new(),
            last_tick: None,
            registry,
            executor,
            overlap,
            workers,
            lease_grace: Duration::from_secs(lease_grace_secs),
        }
    }

    /// Names of registered events.
    pub fn event_names(&self) -> Vec<&str> {
        self.events.keys().map(String::as_str).collect()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Treat `at` as the previous tick; the next tick fires anything due after it.
    pub fn set_last_tick(&mut self, at: DateTime<Utc>) {
        self.last_tick = Some(at);
    }

    /// Fire every event with a fire instant in `(last_tick, now]`, once each.
    /// The first tick only records the baseline.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<(String, FireOutcome)> {
        let Some(since) = self.last_tick else {
            self.last_tick = Some(now);
            return Vec::new();
        };
        if now <= since {
            return Vec::new();
        }
        self.last_tick = Some(now);

        let due: Vec<(String, EventSource, Duration)> = self
            .events
            .values()
            .filter(|event| event.schedule.fires_in(since, now))
            .map(|event| (event.name.clone(), event.source.clone(), event.lease_ttl))
            .collect();

        let mut fired = Vec::with_capacity(due.len());
        for (name, source, lease_ttl) in due {
            tracing::info!("🔔 Event fired: {name}");
            let outcome = match source {
                EventSource::Task { task_id } => self.fire_task(&name, task_id, lease_ttl).await,
                EventSource::Static { command } => self.fire_static(&name, &command).await,
            };
            fired.push((name, outcome));
        }
        fired
    }

    async fn fire_task(&self, name: &str, task_id: TaskId, lease_ttl: Duration) -> FireOutcome {
        let task = match self.registry.find_task(task_id) {
            Ok(Some(task)) if task.is_active => task,
            Ok(Some(task)) => {
                tracing::info!("⏸️ Task {} ('{}') is inactive, skipping", task.id, task.name);
                return FireOutcome::Skipped(SkipReason::Inactive);
            }
            Ok(None) => {
                tracing::info!("⏸️ Task {task_id} no longer exists, skipping");
                return FireOutcome::Skipped(SkipReason::Missing);
            }
            Err(e) => {
                tracing::error!("❌ Could not load task {task_id}: {e}");
                return FireOutcome::Error(e.to_string());
            }
        };

        if let Err(e) = TaskAction::resolve(&task) {
            tracing::warn!("⚠️ Task {} ('{}') rejected: {e}", task.id, task.name);
            return FireOutcome::Skipped(SkipReason::Rejected(e.to_string()));
        }

        let lease = if task.prevent_overlap {
            let task_ttl = task.timeout(self.executor.settings().default_timeout_secs) + self.lease_grace;
            let ttl = lease_ttl.max(task_ttl);
            match Lease::acquire(&self.overlap, name, ttl) {
                Ok(Some(lease)) => Some(lease),
                Ok(None) => {
                    tracing::info!(
                        "⏭️ Task {} ('{}') still running elsewhere, skipping",
                        task.id,
                        task.name
                    );
                    return FireOutcome::Skipped(SkipReason::Overlapping);
                }
                Err(e) => {
                    tracing::error!("❌ Lease for task {} unavailable: {e}", task.id);
                    return FireOutcome::Error(e.to_string());
                }
            }
        } else {
            None
        };

        self.start_run(task, lease, TriggeredBy::Schedule, None).await
    }

    /// Open the log and run inline or hand off to the worker pool.
    async fn start_run(
        &self,
        task: TaskDefinition,
        lease: Option<Lease>,
        triggered_by: TriggeredBy,
        user: Option<i64>,
    ) -> FireOutcome {
        let log = match history::open(self.executor.db(), task.id, triggered_by, user) {
            Ok(log) => log,
            Err(e) => {
                tracing::error!("❌ Could not open log for task {}: {e}", task.id);
                return FireOutcome::Error(e.to_string());
            }
        };
        let log_id = log.id;

        if task.run_in_background {
            if let Some(pool) = &self.workers {
                return match pool.enqueue(ExecutionRequest { task, log, lease }) {
                    Ok(()) => FireOutcome::Queued { log_id },
                    Err(e) => FireOutcome::Error(e.to_string()),
                };
            }
            tracing::debug!("No worker pool; running task {} inline", task.id);
        }

        let status = match self.executor.execute(&task, log).await {
            Ok(summary) => summary.log.status,
            Err(TaskdeckError::TimedOut(_)) => RunStatus::TimedOut,
            Err(_) => RunStatus::Failed,
        };
        drop(lease);
        FireOutcome::Completed { log_id, status }
    }

    async fn fire_static(&self, name: &str, command: &str) -> FireOutcome {
        match self.executor.commands().run(command, &[]).await {
            Ok(out) if out.success() => {
                tracing::info!("✅ {name} finished");
                FireOutcome::StaticCompleted { success: true }
            }
            Ok(out) => {
                tracing::error!("❌ {name} exited with {:?}: {}", out.exit_code, out.combined());
                FireOutcome::StaticCompleted { success: false }
            }
            Err(e) => {
                tracing::error!("❌ {name} could not start: {e}");
                FireOutcome::StaticCompleted { success: false }
            }
        }
    }
}

impl EventSink for SchedulerEngine {
    fn register(&mut self, event: ScheduledEvent) {
        self.seen.insert(event.name.clone());
        self.events.insert(event.name.clone(), event);
    }

    fn begin_build(&mut self) {
        self.seen.clear();
    }

    fn finish_build(&mut self, complete: bool) {
        let seen = &self.seen;
        self.events.retain(|name, event| {
            seen.contains(name) && (complete || matches!(event.source, EventSource::Static { .. }))
        });
        if !complete {
            tracing::warn!("⚠️ Task list unavailable, only {} static events this cycle", self.events.len());
        }
    }
}

/// Spawn the scheduler loop: build once, then tick every `tick_secs` and
/// rebuild every `rebuild_secs` (0 = never).
pub async fn spawn_scheduler(
    engine: Arc<Mutex<SchedulerEngine>>,
    builder: ScheduleBuilder,
    tick_secs: u64,
    rebuild_secs: u64,
) {
    tracing::info!("⏰ Scheduler started (tick every {tick_secs}s, rebuild every {rebuild_secs}s)");
    {
        let mut eng = engine.lock().await;
        builder.build(&mut *eng);
        eng.set_last_tick(Utc::now());
    }

    let mut interval = tokio::time::interval(Duration::from_secs(tick_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_build = tokio::time::Instant::now();

    loop {
        interval.tick().await;

        let mut eng = engine.lock().await;
        if rebuild_secs > 0 && last_build.elapsed() >= Duration::from_secs(rebuild_secs) {
            builder.build(&mut *eng);
            last_build = tokio::time::Instant::now();
        }
        let fired = eng.tick(Utc::now()).await;
        if !fired.is_empty() {
            tracing::debug!("⏰ Tick fired {} events", fired.len());
        }
    }
}
