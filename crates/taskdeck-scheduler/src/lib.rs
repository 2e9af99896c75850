//! # Taskdeck Scheduler
//!
//! Database-driven cron engine. Tasks live in SQLite and are edited at
//! runtime; the schedule is rebuilt from them, each run is recorded in an
//! execution log, and a per-task monitor tracks health.
//!
//! ## Architecture
//! ```text
//! SchedulerDb (scheduled_tasks, logs, monitors, leases)
//!   └── ScheduleBuilder ── active tasks + static entries ──► SchedulerEngine
//!                                                              │ tick(now)
//!                          re-fetch task, resolve action, lease │
//!                                                              ▼
//!                          foreground ──► TaskExecutor ◄── WorkerPool (background)
//!                                           ├── CommandRunner / JobRegistry / maintenance
//!                                           ├── history::close (exactly once)
//!                                           ├── monitor::record_outcome
//!                                           └── Notifier (on health flip)
//!
//! TaskService: admin queries, edits, run-now, soft delete, health audit
//! ```

pub mod action;
pub mod builder;
pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod executor;
pub mod history;
pub mod jobs;
pub mod lock;
pub mod monitor;
pub mod notify;
pub mod persistence;
pub mod registry;
pub mod runner;
pub mod seed;
pub mod service;
pub mod tasks;
pub mod worker;

pub use action::{MaintenanceAction, TaskAction};
pub use builder::{BuildReport, EventSink, ScheduleBuilder, ScheduledEvent};
pub use cron::CronSchedule;
pub use dispatch::{NotifyTarget, Notifier};
pub use engine::{FireOutcome, SchedulerEngine, spawn_scheduler};
pub use executor::{ExecutionSummary, ExecutorSettings, TaskExecutor};
pub use jobs::{JobRegistry, UnitOfWork};
pub use lock::{InMemoryLeases, Lease, OverlapGuard, SqliteLeases, overlap_guard};
pub use monitor::TaskMonitor;
pub use notify::{Notification, NotifyPriority, NotifyRouter};
pub use persistence::{SchedulerDb, TaskFilter};
pub use registry::TaskRegistry;
pub use runner::{CommandRunner, ShellCommandRunner};
pub use service::{RunNowOutcome, RunRequest, TaskOverview, TaskService};
pub use tasks::{
    ExecutionLog, NewTask, RunStatus, TaskCategory, TaskDefinition, TaskKind, TaskUpdate,
    TriggeredBy,
};
pub use worker::{ExecutionRequest, WorkerPool};
