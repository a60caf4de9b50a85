//! Notification dispatch — accepted task mutations become user-visible
//! acknowledgements.
//!
//! Pure mapping plus one side-effecting call into a [`NotificationSink`].
//! The sink is the presentation layer's door: it receives message, severity
//! and an optional navigate-to task id, and has no visibility into event
//! kinds or pipeline internals. No batching, no internal state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::events::{MutationKind, Task};

/// Presentation severity class for an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Success,
    /// The unstyled class; the UI renders it without accent.
    #[serde(rename = "default")]
    Info,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Success => write!(f, "success"),
            Severity::Info => write!(f, "default"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// One acknowledgement handed to the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub message: String,
    pub severity: Severity,
    /// Task to focus when the user clicks the acknowledgement. Absent for
    /// deletions, where nothing is left to navigate to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigate_to: Option<i64>,
}

/// Presentation-layer collaborator.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, notification: Notification);
}

/// Map an accepted mutation to its acknowledgement. Pure.
pub fn render(kind: MutationKind, task: &Task) -> Notification {
    let message = format!("Task \"{}\" {}", task.title, kind);
    let severity = match kind {
        MutationKind::Created | MutationKind::Completed => Severity::Success,
        MutationKind::Deleted => Severity::Warning,
        MutationKind::Updated => Severity::Info,
    };
    let navigate_to = (kind != MutationKind::Deleted).then_some(task.id);
    Notification {
        message,
        severity,
        navigate_to,
    }
}

/// Stateless dispatcher: render, then forward to the sink.
pub struct NotificationDispatcher {
    sink: Arc<dyn NotificationSink>,
}

impl NotificationDispatcher {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    pub fn notify(&self, kind: MutationKind, task: &Task) {
        self.sink.publish(render(kind, task));
    }
}

// ─── Bundled sinks ───────────────────────────────────────────────────────────

/// Fan-out sink: serializes acknowledgements as JSON-RPC notifications on a
/// broadcast channel, one subscription per connected UI client.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<String>,
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn publish(&self, notification: Notification) {
        let wire = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notification.show",
            "params": notification,
        });
        // Ignore errors — no subscribers is fine
        let _ = self
            .tx
            .send(serde_json::to_string(&wire).unwrap_or_default());
    }
}

/// Headless sink: acknowledgements go to the structured log.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn publish(&self, notification: Notification) {
        info!(
            severity = %notification.severity,
            task_id = ?notification.navigate_to,
            "{}",
            notification.message
        );
    }
}
