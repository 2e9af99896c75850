//! Resolution of a task's `(kind, action, parameters)` into something runnable.
//!
//! Inline scripts are never evaluated: the `action` of an `InlineScript` task
//! must name one of the maintenance actions compiled into this crate.

use serde::{Deserialize, Serialize};

use crate::tasks::{TaskDefinition, TaskKind, TaskParameters};
use taskdeck_core::error::{Result, TaskdeckError};

/// What a task will actually do when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskAction {
    /// A command line plus `--name=value` flags built from the parameters.
    Command { command: String, arguments: Vec<String> },
    /// A registered unit-of-work type with positional arguments.
    UnitOfWork { type_id: String, arguments: Vec<serde_json::Value> },
    /// A built-in maintenance action.
    Maintenance { action: MaintenanceAction, parameters: TaskParameters },
}

impl TaskAction {
    /// Resolve a task into its action. Runs before any execution log exists,
    /// so a rejection here leaves no trace in the history.
    pub fn resolve(task: &TaskDefinition) -> Result<Self> {
        let action = task.action.trim();
        if action.is_empty() {
            return Err(TaskdeckError::validation(format!("task {} has an empty action", task.id)));
        }
        match task.kind {
            TaskKind::Command => Ok(TaskAction::Command {
                command: action.to_string(),
                arguments: command_arguments(&task.parameters),
            }),
            TaskKind::UnitOfWork => Ok(TaskAction::UnitOfWork {
                type_id: action.to_string(),
                arguments: task.parameters.iter().map(|(_, v)| v.clone()).collect(),
            }),
            TaskKind::InlineScript => {
                if !task.is_system {
                    return Err(TaskdeckError::validation(format!(
                        "task {} ('{}') is an inline script but not a system task",
                        task.id, task.name
                    )));
                }
                let maintenance = MaintenanceAction::lookup(action)?;
                Ok(TaskAction::Maintenance {
                    action: maintenance,
                    parameters: task.parameters.clone(),
                })
            }
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        match self {
            TaskAction::Command { command, .. } => format!("command '{command}'"),
            TaskAction::UnitOfWork { type_id, .. } => format!("unit of work '{type_id}'"),
            TaskAction::Maintenance { action, .. } => format!("maintenance '{}'", action.name()),
        }
    }
}

/// Render parameters as command-line flags.
///
/// `true` becomes a bare `--name`; `false` and `null` are dropped; strings are
/// passed unquoted; anything else uses its JSON text.
pub fn command_arguments(parameters: &TaskParameters) -> Vec<String> {
    parameters
        .iter()
        .filter_map(|(name, value)| match value {
            serde_json::Value::Bool(true) => Some(format!("--{name}")),
            serde_json::Value::Bool(false) | serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(format!("--{name}={s}")),
            other => Some(format!("--{name}={other}")),
        })
        .collect()
}

// ─── Maintenance Catalog ──────────────────────────────────────

/// Built-in actions available to system `InlineScript` tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaintenanceAction {
    /// Delete closed execution logs past the retention window.
    /// Optional parameter `days` overrides the configured retention.
    PruneExecutionLogs,
    /// Re-evaluate the health record of every live task.
    RefreshHealth,
}

impl MaintenanceAction {
    pub const ALL: [MaintenanceAction; 2] =
        [MaintenanceAction::PruneExecutionLogs, MaintenanceAction::RefreshHealth];

    pub fn name(&self) -> &'static str {
        match self {
            MaintenanceAction::PruneExecutionLogs => "prune-execution-logs",
            MaintenanceAction::RefreshHealth => "refresh-health",
        }
    }

    pub fn lookup(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.name() == name.trim())
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|a| a.name()).collect();
                TaskdeckError::validation(format!(
                    "Unknown maintenance action '{name}' (available: {})",
                    known.join(", ")
                ))
            })
    }
}
