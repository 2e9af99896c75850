//! Health alerts: what gets sent when a task turns unhealthy.
//! Lightweight: no queues. Keep the last 100 in memory and hand each one to
//! the configured targets.

use serde::{Deserialize, Serialize};

use crate::monitor::TaskMonitor;
use crate::tasks::TaskDefinition;

const HISTORY_LIMIT: usize = 100;

/// A notification about a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Title/summary.
    pub title: String,
    /// Body content.
    pub body: String,
    pub priority: NotifyPriority,
    /// Which task or subsystem raised it.
    pub source: String,
    /// Recipient named on the task, if any.
    pub recipient: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Notification priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotifyPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Notification {
    pub fn new(title: &str, body: &str, source: &str, priority: NotifyPriority) -> Self {
        Self {
            title: title.to_string(),
            body: body.to_string(),
            priority,
            source: source.to_string(),
            recipient: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Alert for a task whose health just flipped to unhealthy.
    pub fn task_unhealthy(task: &TaskDefinition, monitor: &TaskMonitor) -> Self {
        let reason = monitor
            .health_check_message
            .as_deref()
            .unwrap_or("health check failed");
        let mut n = Self::new(
            &format!("Scheduled task '{}' is unhealthy", task.name),
            &format!(
                "Task {} ({} '{}') is unhealthy: {reason}.",
                task.id, task.kind, task.action
            ),
            &format!("scheduled-task:{}", task.id),
            NotifyPriority::High,
        );
        n.recipient = task.notification_email.clone();
        n
    }
}

/// In-memory record of sent notifications.
#[derive(Debug, Default)]
pub struct NotifyRouter {
    history: Vec<Notification>,
}

impl NotifyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a notification, keeping only the last 100.
    pub fn record(&mut self, notification: Notification) {
        self.history.push(notification);
        if self.history.len() > HISTORY_LIMIT {
            self.history.remove(0);
        }
    }

    pub fn history(&self) -> &[Notification] {
        &self.history
    }
}
