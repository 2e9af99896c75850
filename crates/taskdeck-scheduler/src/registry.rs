//! Task registry: the read contract the scheduler needs, plus write-time checks.

use crate::action::MaintenanceAction;
use crate::persistence::SchedulerDb;
use crate::tasks::{TaskDefinition, TaskId, TaskKind};
use taskdeck_core::error::{Result, TaskdeckError};

/// Durable source of task definitions.
pub trait TaskRegistry: Send + Sync {
    /// Non-deleted tasks with `is_active` set. Order is not significant.
    fn active_tasks(&self) -> Result<Vec<TaskDefinition>>;

    /// A non-deleted task by id.
    fn find_task(&self, id: TaskId) -> Result<Option<TaskDefinition>>;
}

impl TaskRegistry for SchedulerDb {
    fn active_tasks(&self) -> Result<Vec<TaskDefinition>> {
        SchedulerDb::active_tasks(self)
    }

    fn find_task(&self, id: TaskId) -> Result<Option<TaskDefinition>> {
        self.get_task(id)
    }
}

/// Checks that need the store: the (action, kind) pair is free among live
/// tasks, and inline scripts name a known maintenance action.
pub fn validate_against_store(
    db: &SchedulerDb,
    action: &str,
    kind: TaskKind,
    exclude: Option<TaskId>,
) -> Result<()> {
    if kind == TaskKind::InlineScript {
        MaintenanceAction::lookup(action)?;
    }
    if let Some(existing) = db.find_by_action(action, kind, exclude)? {
        return Err(TaskdeckError::validation(format!(
            "A task with action '{}' and kind '{kind}' already exists (task {existing})",
            action.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::NewTask;
    use chrono::Utc;

    #[test]
    fn test_registry_view_of_db() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let task = db
            .insert_task(&NewTask::command("a", "a:run", "* * * * *"), Utc::now())
            .unwrap();
        let registry: &dyn TaskRegistry = &db;
        assert_eq!(registry.active_tasks().unwrap().len(), 1);
        assert!(registry.find_task(task.id).unwrap().is_some());

        db.soft_delete(task.id, Utc::now()).unwrap();
        assert!(registry.find_task(task.id).unwrap().is_none());
        assert!(registry.active_tasks().unwrap().is_empty());
    }

    #[test]
    fn test_uniqueness_and_catalog() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let task = db
            .insert_task(&NewTask::command("a", "a:run", "* * * * *"), Utc::now())
            .unwrap();
        assert!(validate_against_store(&db, "a:run", TaskKind::Command, None).is_err());
        assert!(validate_against_store(&db, "a:run", TaskKind::Command, Some(task.id)).is_ok());
        assert!(validate_against_store(&db, "a:run", TaskKind::UnitOfWork, None).is_ok());
        assert!(validate_against_store(&db, "eval(1)", TaskKind::InlineScript, None).is_err());
        assert!(validate_against_store(&db, "refresh-health", TaskKind::InlineScript, None).is_ok());
    }
}
