//! Error taxonomy for Taskdeck.
//!
//! Validation errors surface to the caller immediately. Registration and
//! infrastructure errors are contained by the schedule builder. Execution
//! failures are recorded first and then returned to the invoking layer.

/// Unified error type.
#[derive(Debug, thiserror::Error)]
pub enum TaskdeckError {
    /// Malformed input: bad cron expression, unknown kind, forbidden inline script.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A single task could not be turned into a schedulable event.
    #[error("Registration failed for task {task_id} ({name}): {reason}")]
    Registration {
        task_id: i64,
        name: String,
        reason: String,
    },

    /// The task's action ran and failed (nonzero exit, raised error).
    #[error("Execution failed: {0}")]
    Execution(String),

    /// The task exceeded its runtime ceiling.
    #[error("Execution timed out after {0}s")]
    TimedOut(u64),

    /// The registry or another backing service is unavailable.
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation is not allowed for this record (e.g. deleting a system task).
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// `close` was called on a log that already reached a terminal state.
    #[error("Execution log {0} is already closed")]
    LogAlreadyClosed(i64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TaskdeckError {
    /// Whether an outer retry layer may try the same operation again.
    /// Taskdeck itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskdeckError::Execution(_)
                | TaskdeckError::TimedOut(_)
                | TaskdeckError::Infrastructure(_)
                | TaskdeckError::Database(_)
                | TaskdeckError::Io(_)
        )
    }

    /// Build a validation error from anything printable.
    pub fn validation(msg: impl Into<String>) -> Self {
        TaskdeckError::Validation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, TaskdeckError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TaskdeckError::Execution("exit 1".into()).is_retryable());
        assert!(TaskdeckError::TimedOut(30).is_retryable());
        assert!(!TaskdeckError::validation("bad cron").is_retryable());
        assert!(!TaskdeckError::Forbidden("system task".into()).is_retryable());
        assert!(!TaskdeckError::LogAlreadyClosed(7).is_retryable());
    }

    #[test]
    fn test_registration_message_names_task() {
        let err = TaskdeckError::Registration {
            task_id: 42,
            name: "nightly backup".into(),
            reason: "invalid timezone".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("nightly backup"));
    }
}
