//! Step machine — append-only progress record of one agent run.
//!
//! The machine owns the step list; exactly one pipeline task mutates it.
//! Observers read immutable `Arc<[LifecycleStep]>` snapshots published
//! through a watch channel after every mutation, so a reader never sees a
//! half-applied update.
//!
//! This is a UI progress indicator, not an audit ledger: "end" events are
//! matched to their "start" step by call id when the payload carries one,
//! and by type + recency otherwise. Callers must not rely on it for
//! correctness-critical pairing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

/// The step categories rendered by the progress UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    AgentStart,
    AgentEnd,
    LlmStart,
    LlmEnd,
    McpRequest,
    McpResponse,
    ToolRunning,
    Handoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Active,
    Completed,
}

/// One recorded phase of an agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleStep {
    pub id: String,
    pub step_type: StepType,
    pub message: String,
    pub status: StepStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Value,
}

/// Read side of the machine: latest published snapshot + change signal.
pub type LifecycleView = watch::Receiver<Arc<[LifecycleStep]>>;

/// Ordered step list with the single-active invariant.
///
/// Steps are append-only. Nothing is ever removed; completion only flips
/// status and stamps `completed_at`. `reset` starts a fresh run.
pub struct StepMachine {
    steps: Vec<LifecycleStep>,
    snapshot_tx: watch::Sender<Arc<[LifecycleStep]>>,
}

impl Default for StepMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StepMachine {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::from(Vec::new()));
        Self {
            steps: Vec::new(),
            snapshot_tx,
        }
    }

    /// Subscribe to published snapshots.
    pub fn view(&self) -> LifecycleView {
        self.snapshot_tx.subscribe()
    }

    /// Current steps, in append order.
    pub fn steps(&self) -> &[LifecycleStep] {
        &self.steps
    }

    /// Append a new active step.
    ///
    /// A new phase beginning implies the previous one ended even when no
    /// explicit "end" event arrived, so the currently active step (if any)
    /// is completed first. Upstream agents drop events; the list must stay
    /// sane anyway.
    pub fn add_step(&mut self, step_type: StepType, message: impl Into<String>, metadata: Value) {
        let now = Utc::now();
        if let Some(idx) = self.last_active_index() {
            self.complete_at(idx, now);
        }
        self.steps.push(LifecycleStep {
            id: uuid::Uuid::new_v4().to_string(),
            step_type,
            message: message.into(),
            status: StepStatus::Active,
            created_at: now,
            completed_at: None,
            metadata,
        });
        self.publish();
    }

    /// Complete the most recent active step. No-op if none is active.
    pub fn complete_last_step(&mut self) {
        if let Some(idx) = self.last_active_index() {
            self.complete_at(idx, Utc::now());
            self.publish();
        }
    }

    /// Complete the most recent active step of `step_type`.
    ///
    /// Used when an "end" event must close a specific, possibly non-latest,
    /// step. No-op (and therefore idempotent) when no such step is active.
    pub fn complete_step_by_type(&mut self, step_type: StepType) {
        let idx = self
            .steps
            .iter()
            .rposition(|s| s.status == StepStatus::Active && s.step_type == step_type);
        if let Some(idx) = idx {
            self.complete_at(idx, Utc::now());
            self.publish();
        }
    }

    /// Complete the active step whose metadata recorded `call_id`.
    ///
    /// Returns false when no active step matches, letting the caller fall
    /// back to type-based matching for payloads without an identifier.
    pub fn complete_step_by_call_id(&mut self, call_id: &str) -> bool {
        let idx = self.steps.iter().rposition(|s| {
            s.status == StepStatus::Active
                && s.metadata.get("call_id").and_then(Value::as_str) == Some(call_id)
        });
        match idx {
            Some(idx) => {
                self.complete_at(idx, Utc::now());
                self.publish();
                true
            }
            None => false,
        }
    }

    /// Discard all steps. Called when a new agent run begins.
    pub fn reset(&mut self) {
        self.steps.clear();
        self.publish();
    }

    /// Whether this run has recorded its terminal `agent_end` marker.
    pub fn run_finished(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.step_type == StepType::AgentEnd)
    }

    fn last_active_index(&self) -> Option<usize> {
        self.steps
            .iter()
            .rposition(|s| s.status == StepStatus::Active)
    }

    fn complete_at(&mut self, idx: usize, at: DateTime<Utc>) {
        let step = &mut self.steps[idx];
        step.status = StepStatus::Completed;
        step.completed_at = Some(at);
    }

    /// Publish a fresh immutable snapshot. Single assignment: readers hold
    /// either the old Arc or the new one, never a torn list.
    fn publish(&self) {
        self.snapshot_tx.send_replace(self.steps.clone().into());
    }
}
