//! Background worker pool for tasks with `run_in_background`.
//! A bounded queue drained by a fixed number of tokio workers.

use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::executor::TaskExecutor;
use crate::history::{self, LogClosure};
use crate::lock::Lease;
use crate::monitor;
use crate::tasks::{ExecutionLog, RunStatus, TaskDefinition};
use taskdeck_core::error::{Result, TaskdeckError};

/// One queued run. The log is already open; the lease (if any) is released
/// when the run finishes.
#[derive(Debug)]
pub struct ExecutionRequest {
    pub task: TaskDefinition,
    pub log: ExecutionLog,
    pub lease: Option<Lease>,
}

/// Shared by the engine and the admin service; `shutdown` takes `&self`.
pub struct WorkerPool {
    tx: StdMutex<Option<mpsc::Sender<ExecutionRequest>>>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
    executor: TaskExecutor,
}

impl WorkerPool {
    /// Start `workers` workers reading from a queue of `capacity`.
    pub fn start(executor: TaskExecutor, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|id| tokio::spawn(worker_loop(id, executor.clone(), Arc::clone(&rx))))
            .collect();
        tracing::info!("👷 Worker pool started ({} workers, queue {capacity})", workers.max(1));
        Self {
            tx: StdMutex::new(Some(tx)),
            handles: StdMutex::new(handles),
            executor,
        }
    }

    /// Queue a run. When the queue is full or closed the open log is closed
    /// as Failed and an error is returned.
    pub fn enqueue(&self, request: ExecutionRequest) -> Result<()> {
        let tx = self.tx.lock().ok().and_then(|guard| guard.clone());
        let Some(tx) = tx else {
            return Err(self.reject(request, "background queue is closed"));
        };
        match tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(request)) => {
                Err(self.reject(request, "background queue is full"))
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                Err(self.reject(request, "background queue is closed"))
            }
        }
    }

    fn reject(&self, request: ExecutionRequest, reason: &str) -> TaskdeckError {
        let ExecutionRequest { task, log, lease } = request;
        tracing::error!("❌ Task {} ('{}') not queued: {reason}", task.id, task.name);
        let db = self.executor.db();
        let settings = self.executor.settings();
        let closure = LogClosure::failure(RunStatus::Failed, reason, String::new());
        match history::close(db, log.id, closure, settings.output_limit_bytes) {
            Ok(closed) => {
                if let Err(e) =
                    monitor::record_outcome(db, &task, &closed, settings.max_consecutive_failures)
                {
                    tracing::warn!("⚠️ Monitor update failed for task {}: {e}", task.id);
                }
            }
            Err(e) => tracing::warn!("⚠️ Could not close log {}: {e}", log.id),
        }
        drop(lease);
        TaskdeckError::Infrastructure(reason.to_string())
    }

    /// Stop accepting work, let queued runs finish, then join the workers.
    pub async fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("⚠️ Worker ended abnormally: {e}");
            }
        }
        tracing::info!("👷 Worker pool stopped");
    }
}

async fn worker_loop(
    id: usize,
    executor: TaskExecutor,
    rx: Arc<Mutex<mpsc::Receiver<ExecutionRequest>>>,
) {
    loop {
        let next = { rx.lock().await.recv().await };
        let Some(ExecutionRequest { task, log, lease }) = next else {
            break;
        };
        tracing::debug!("👷 Worker {id} picked task {} (log {})", task.id, log.id);
        let log_id = log.id;
        match executor.execute(&task, log).await {
            Ok(_) => {}
            // Run failures are already in the log and monitor.
            Err(e @ (TaskdeckError::Execution(_) | TaskdeckError::TimedOut(_))) => {
                tracing::debug!("👷 Worker {id} finished task {} with failure: {e}", task.id);
            }
            Err(e) => {
                tracing::warn!("⚠️ Worker {id}: task {} (log {log_id}) not fully recorded: {e}", task.id);
            }
        }
        drop(lease);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::{FakeRunner, executor_with};
    use crate::lock::{InMemoryLeases, OverlapGuard};
    use crate::persistence::SchedulerDb;
    use crate::tasks::{NewTask, TriggeredBy};
    use std::time::Duration;

    #[tokio::test]
    async fn test_background_runs_complete_and_release_lease() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let executor = executor_with(db.clone(), Arc::new(FakeRunner::exiting(0)));
        let pool = WorkerPool::start(executor, 2, 8);
        let task = db
            .insert_task(&NewTask::command("Bg", "bg:run", "* * * * *"), chrono::Utc::now())
            .unwrap();

        let guard: Arc<dyn OverlapGuard> = Arc::new(InMemoryLeases::new());
        let lease = Lease::acquire(&guard, "scheduled-task:1", Duration::from_secs(60)).unwrap();
        let log = history::open(&db, task.id, TriggeredBy::Schedule, None).unwrap();
        pool.enqueue(ExecutionRequest { task: task.clone(), log, lease }).unwrap();
        pool.shutdown().await;

        assert_eq!(db.latest_log(task.id).unwrap().unwrap().status, RunStatus::Success);
        assert!(Lease::acquire(&guard, "scheduled-task:1", Duration::from_secs(60)).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_full_queue_closes_log() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let runner = Arc::new(FakeRunner {
            exit_code: 0,
            delay: Duration::from_millis(300),
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let executor = executor_with(db.clone(), runner);
        let pool = WorkerPool::start(executor, 1, 1);
        let task = db
            .insert_task(&NewTask::command("Bg", "bg:run", "* * * * *"), chrono::Utc::now())
            .unwrap();

        let mut rejected = 0;
        for _ in 0..4 {
            let log = history::open(&db, task.id, TriggeredBy::Schedule, None).unwrap();
            if pool.enqueue(ExecutionRequest { task: task.clone(), log, lease: None }).is_err() {
                rejected += 1;
            }
        }
        assert!(rejected >= 1);
        pool.shutdown().await;
        assert!(db.open_logs(task.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_worker_survives_unrecordable_result() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let executor = executor_with(db.clone(), Arc::new(FakeRunner::exiting(0)));
        let pool = WorkerPool::start(executor, 1, 8);
        let task = db
            .insert_task(&NewTask::command("Bg", "bg:run", "* * * * *"), chrono::Utc::now())
            .unwrap();
        db.execute_sql(
            "CREATE TRIGGER reject_success BEFORE UPDATE ON scheduled_task_logs
             WHEN NEW.status = 'success'
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
        )
        .unwrap();

        for _ in 0..2 {
            let log = history::open(&db, task.id, TriggeredBy::Schedule, None).unwrap();
            pool.enqueue(ExecutionRequest { task: task.clone(), log, lease: None }).unwrap();
        }
        pool.shutdown().await;

        let logs = db.logs_for_task(task.id, 10).unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|log| log.status == RunStatus::Failed));
        assert!(db.open_logs(task.id).unwrap().is_empty());
    }
}
