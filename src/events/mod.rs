//! Domain event model for the live-sync pipeline.
//!
//! Every frame on the push stream decodes to exactly one [`Event`]. The
//! first ten kinds describe an agent run and drive the lifecycle step
//! machine; the four `task_*` kinds are task mutations and drive the
//! reconciliation store. Task kinds also accept the dotted wire spelling
//! (`task.created` …) emitted by the CRUD backend's change feed.

pub mod decoder;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Task snapshot ───────────────────────────────────────────────────────────

/// Task priority as stored by the CRUD backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// A full task snapshot as carried by mutation events.
///
/// The CRUD backend is authoritative for these fields; the local cache never
/// invents or edits them, it only stores the most recent accepted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    pub updated_at: DateTime<Utc>,
}

// ─── Event union ─────────────────────────────────────────────────────────────

/// One decoded frame from the push stream.
///
/// Tagged by the frame's `type` field. Payload fields carry what the UI and
/// the pipelines actually consume: agent and model names, tool names, the
/// call identifier used for step correlation, and task snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    AgentStart {
        agent: String,
    },
    AgentEnd {
        agent: String,
    },
    LlmStart {
        agent: String,
        model: String,
    },
    LlmEnd {
        agent: String,
    },
    McpRequest {
        server: String,
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },
    McpResponse {
        server: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },
    ToolCall {
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(default)]
        arguments: Value,
    },
    ToolResult {
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(default)]
        output: Value,
    },
    HandoffRequest {
        from_agent: String,
        to_agent: String,
    },
    HandoffComplete {
        from_agent: String,
        to_agent: String,
    },
    #[serde(alias = "task.created")]
    TaskCreated {
        task: Task,
        #[serde(alias = "serverTimestamp")]
        server_timestamp: DateTime<Utc>,
    },
    #[serde(alias = "task.updated")]
    TaskUpdated {
        task: Task,
        #[serde(alias = "serverTimestamp")]
        server_timestamp: DateTime<Utc>,
    },
    #[serde(alias = "task.deleted")]
    TaskDeleted {
        task: Task,
        #[serde(alias = "serverTimestamp")]
        server_timestamp: DateTime<Utc>,
    },
    #[serde(alias = "task.completed")]
    TaskCompleted {
        task: Task,
        #[serde(alias = "serverTimestamp")]
        server_timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Wire name of this event kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::AgentStart { .. } => "agent_start",
            Event::AgentEnd { .. } => "agent_end",
            Event::LlmStart { .. } => "llm_start",
            Event::LlmEnd { .. } => "llm_end",
            Event::McpRequest { .. } => "mcp_request",
            Event::McpResponse { .. } => "mcp_response",
            Event::ToolCall { .. } => "tool_call",
            Event::ToolResult { .. } => "tool_result",
            Event::HandoffRequest { .. } => "handoff_request",
            Event::HandoffComplete { .. } => "handoff_complete",
            Event::TaskCreated { .. } => "task_created",
            Event::TaskUpdated { .. } => "task_updated",
            Event::TaskDeleted { .. } => "task_deleted",
            Event::TaskCompleted { .. } => "task_completed",
        }
    }

    /// Split the union at the pipeline fork: task mutations go to the
    /// reconciliation branch, everything else to the lifecycle branch.
    pub fn into_task_mutation(self) -> Result<TaskMutationEvent, Event> {
        let (kind, task, server_timestamp) = match self {
            Event::TaskCreated {
                task,
                server_timestamp,
            } => (MutationKind::Created, task, server_timestamp),
            Event::TaskUpdated {
                task,
                server_timestamp,
            } => (MutationKind::Updated, task, server_timestamp),
            Event::TaskDeleted {
                task,
                server_timestamp,
            } => (MutationKind::Deleted, task, server_timestamp),
            Event::TaskCompleted {
                task,
                server_timestamp,
            } => (MutationKind::Completed, task, server_timestamp),
            other => return Err(other),
        };
        Ok(TaskMutationEvent {
            kind,
            task,
            server_timestamp,
        })
    }
}

// ─── Task mutations ──────────────────────────────────────────────────────────

/// What a task mutation did, independent of wire spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Created,
    Updated,
    Deleted,
    Completed,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationKind::Created => write!(f, "created"),
            MutationKind::Updated => write!(f, "updated"),
            MutationKind::Deleted => write!(f, "deleted"),
            MutationKind::Completed => write!(f, "completed"),
        }
    }
}

/// A normalized task mutation, as delivered to the reconciliation store.
///
/// `server_timestamp` is the backend's ordering authority: for one task id
/// the mutation with the greatest timestamp wins, regardless of arrival
/// order or duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMutationEvent {
    pub kind: MutationKind,
    pub task: Task,
    pub server_timestamp: DateTime<Utc>,
}
