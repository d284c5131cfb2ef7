//! Typed routing of agent push messages.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::handlers::InvestigationHandlers;
use super::throttle::{ProgressSnapshot, ProgressThrottle};

/// Alert pushed by the remote agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub message: String,
    #[serde(default = "default_severity")]
    pub severity: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
}

fn default_severity() -> String {
    "info".to_string()
}

/// One push message, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    /// Liveness only
    Heartbeat,
    /// Cluster alert to surface as a notification
    Alert(AlertPayload),
    /// Knowledge-base indexing progress
    KbProgress(ProgressSnapshot),
    /// Any other `type`
    #[serde(other)]
    Unrecognized,
}

impl PushEvent {
    /// Parse a message body.
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}

/// Action attached to an alert notification.
#[derive(Clone, Debug)]
pub struct NotificationAction {
    /// Button label
    pub label: String,
    /// Prompt delivered to investigation handlers
    pub prompt: String,
    handlers: InvestigationHandlers,
}

impl NotificationAction {
    /// Publish the prompt to every registered investigation handler.
    pub fn invoke(&self) -> usize {
        let reached = self.handlers.publish(&self.prompt);
        debug!(reached, "Investigate action invoked");
        reached
    }
}

/// Call made into the external notification layer.
#[derive(Clone, Debug)]
pub struct Notification {
    pub message: String,
    pub severity: String,
    pub resource: String,
    pub action: Option<NotificationAction>,
    pub details: Option<String>,
    pub cluster: Option<String>,
}

/// External collaborator that persists and displays notifications.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Sink that writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn notify(&self, notification: Notification) {
        info!(
            severity = %notification.severity,
            resource = %notification.resource,
            cluster = notification.cluster.as_deref().unwrap_or("-"),
            actionable = notification.action.is_some(),
            "{}",
            notification.message
        );
    }
}

/// Outcome of dispatching one message, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Heartbeat,
    Alert,
    Progress,
    Unrecognized,
    Malformed,
}

/// Routes parsed push events to the notification sink and progress throttle.
pub struct EventDispatcher {
    sink: Arc<dyn NotificationSink>,
    handlers: InvestigationHandlers,
    progress: ProgressThrottle,
}

impl EventDispatcher {
    /// Create a dispatcher. Must be called inside a tokio runtime (the
    /// progress throttle runs as a task).
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        handlers: InvestigationHandlers,
        progress: ProgressThrottle,
    ) -> Self {
        Self {
            sink,
            handlers,
            progress,
        }
    }

    /// Investigation handler registry shared with alert actions.
    pub fn handlers(&self) -> &InvestigationHandlers {
        &self.handlers
    }

    /// Progress throttle fed by `kb_progress` events.
    pub fn progress(&self) -> &ProgressThrottle {
        &self.progress
    }

    /// Parse and route one message body. Malformed bodies are logged and dropped.
    pub fn dispatch(&self, body: &str) -> Dispatched {
        let event = match PushEvent::parse(body) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    error = %e,
                    body = %body.chars().take(200).collect::<String>(),
                    "Dropping malformed push message"
                );
                return Dispatched::Malformed;
            }
        };

        match event {
            PushEvent::Heartbeat => {
                trace!("Heartbeat");
                Dispatched::Heartbeat
            }
            PushEvent::Alert(alert) => {
                self.route_alert(alert, body);
                Dispatched::Alert
            }
            PushEvent::KbProgress(snapshot) => {
                self.progress.push(snapshot);
                Dispatched::Progress
            }
            PushEvent::Unrecognized => {
                debug!("Ignoring push message of unrecognized type");
                Dispatched::Unrecognized
            }
        }
    }

    fn route_alert(&self, alert: AlertPayload, raw: &str) {
        let prompt = investigation_prompt(&alert);
        let action = NotificationAction {
            label: "Investigate".to_string(),
            prompt,
            handlers: self.handlers.clone(),
        };

        self.sink.notify(Notification {
            message: alert.message,
            severity: alert.severity,
            resource: alert.resource,
            action: Some(action),
            details: Some(raw.to_string()),
            cluster: alert.cluster,
        });
    }
}

/// Prompt used when the user chooses to investigate an alert.
pub fn investigation_prompt(alert: &AlertPayload) -> String {
    let mut prompt = format!("Investigate this alert: {}", alert.message);
    if !alert.resource.is_empty() {
        prompt.push_str(&format!(" (resource: {})", alert.resource));
    }
    if let Some(cluster) = alert.cluster.as_deref().filter(|c| !c.is_empty()) {
        prompt.push_str(&format!(" in cluster {}", cluster));
    }
    prompt
}
