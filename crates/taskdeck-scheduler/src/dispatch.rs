//! Notification dispatch: delivers alerts to configured targets.
//! Delivery is best effort; failures are logged and never reach the executor.

use std::sync::Mutex;

use super::notify::{Notification, NotifyRouter};
use taskdeck_core::config::NotifyConfig;

/// Where a notification goes.
#[derive(Debug, Clone)]
pub enum NotifyTarget {
    /// Generic HTTP webhook: POST with JSON body.
    Webhook {
        url: String,
        headers: Vec<(String, String)>,
    },
    /// Write to the tracing log only.
    Log,
}

/// Dispatch a notification to one target.
pub async fn dispatch(notification: &Notification, target: &NotifyTarget) -> Result<(), String> {
    match target {
        NotifyTarget::Webhook { url, headers } => send_webhook(url, headers, notification).await,
        NotifyTarget::Log => {
            tracing::warn!("🔔 {}: {}", notification.title, notification.body);
            Ok(())
        }
    }
}

async fn send_webhook(
    url: &str,
    headers: &[(String, String)],
    notification: &Notification,
) -> Result<(), String> {
    let client = reqwest::Client::new();
    let mut req = client
        .post(url)
        .json(&serde_json::json!({
            "title": notification.title,
            "body": notification.body,
            "priority": notification.priority,
            "source": notification.source,
            "recipient": notification.recipient,
            "timestamp": notification.timestamp.to_rfc3339(),
        }))
        .timeout(std::time::Duration::from_secs(10));

    for (key, value) in headers {
        req = req.header(key.as_str(), value.as_str());
    }

    let resp = req
        .send()
        .await
        .map_err(|e| format!("Webhook send failed: {e}"))?;

    if resp.status().is_success() {
        tracing::info!("✅ Webhook notification sent to {url}: {}", notification.title);
        Ok(())
    } else {
        Err(format!("Webhook error {}", resp.status()))
    }
}

/// Build targets from config. The log target is always present.
pub fn targets_from_config(config: &NotifyConfig) -> Vec<NotifyTarget> {
    let mut targets = vec![NotifyTarget::Log];
    if let Some(url) = config.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
        targets.push(NotifyTarget::Webhook {
            url: url.to_string(),
            headers: config.headers.clone(),
        });
    }
    targets
}

/// Records and fans out notifications.
#[derive(Debug)]
pub struct Notifier {
    router: Mutex<NotifyRouter>,
    targets: Vec<NotifyTarget>,
}

impl Notifier {
    pub fn new(targets: Vec<NotifyTarget>) -> Self {
        Self {
            router: Mutex::new(NotifyRouter::new()),
            targets,
        }
    }

    pub fn from_config(config: &NotifyConfig) -> Self {
        Self::new(targets_from_config(config))
    }

    /// Record and deliver to every target. Returns how many deliveries succeeded.
    pub async fn send(&self, notification: Notification) -> usize {
        let mut delivered = 0;
        for target in &self.targets {
            match dispatch(&notification, target).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("⚠️ Notification '{}' not delivered: {e}", notification.title),
            }
        }
        match self.router.lock() {
            Ok(mut router) => router.record(notification),
            Err(e) => tracing::warn!("⚠️ Notification history unavailable: {e}"),
        }
        delivered
    }

    /// Copy of the recorded history, oldest first.
    pub fn history(&self) -> Vec<Notification> {
        self.router
            .lock()
            .map(|router| router.history().to_vec())
            .unwrap_or_default()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(vec![NotifyTarget::Log])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyPriority;

    #[test]
    fn test_targets_from_config() {
        assert_eq!(targets_from_config(&NotifyConfig::default()).len(), 1);
        let config = NotifyConfig {
            webhook_url: Some("http://127.0.0.1:9/hook".into()),
            headers: vec![("X-Token".into(), "t".into())],
        };
        assert_eq!(targets_from_config(&config).len(), 2);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_contained() {
        // Nothing listens on the discard port; the webhook fails, the log target succeeds.
        let notifier = Notifier::new(vec![
            NotifyTarget::Log,
            NotifyTarget::Webhook {
                url: "http://127.0.0.1:9/hook".into(),
                headers: Vec::new(),
            },
        ]);
        let n = Notification::new("t", "b", "test", NotifyPriority::High);
        assert_eq!(notifier.send(n).await, 1);
        assert_eq!(notifier.history().len(), 1);
    }
}
