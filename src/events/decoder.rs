//! Frame decoder — the parse+classify stage between transport and pipelines.
//!
//! Each inbound text frame is one self-delimited JSON object. [`decode_frame`]
//! turns it into a typed [`Event`] or a [`DecodeError`]; it holds no state and
//! buffers nothing beyond the frame it was handed. [`FrameDecoder`] wraps the
//! pure function with the skip-and-report policy: malformed or unknown frames
//! are dropped, the stream keeps going, and a report lands on a bounded error
//! channel for observers that care.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use super::{Event, Task};

/// Every `type` value this decoder understands, dotted aliases included.
/// A frame whose `type` is absent from this list is a future event kind:
/// dropped, reported, never fatal.
const KNOWN_KINDS: &[&str] = &[
    "agent_start",
    "agent_end",
    "llm_start",
    "llm_end",
    "mcp_request",
    "mcp_response",
    "tool_call",
    "tool_result",
    "handoff_request",
    "handoff_complete",
    "task_created",
    "task_updated",
    "task_deleted",
    "task_completed",
    "task.created",
    "task.updated",
    "task.deleted",
    "task.completed",
];

/// Longest frame prefix preserved in a [`FrameReport`].
const REPORT_FRAME_MAX: usize = 256;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Frame is not valid JSON, or a recognized kind with a bad payload.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Frame parsed but its kind is not one we know. Forward-compatible skip.
    #[error("unknown event kind: {0}")]
    UnknownKind(String),
    /// Frame parsed but carries neither a `type` nor an `eventType` field.
    #[error("frame has no type field")]
    MissingType,
}

/// One skipped frame, as delivered on the decoder's error channel.
#[derive(Debug, Clone)]
pub struct FrameReport {
    /// Rendered decode error.
    pub reason: String,
    /// The offending frame, truncated to a sane length.
    pub frame: String,
    pub at: DateTime<Utc>,
}

// ─── Pure decode ─────────────────────────────────────────────────────────────

/// Mutation frame as the CRUD backend's change feed spells it:
/// `{"eventType": "task.created", "task": {...}, "serverTimestamp": "..."}`.
#[derive(Deserialize)]
struct MutationWire {
    #[serde(rename = "eventType")]
    event_type: String,
    task: Task,
    #[serde(rename = "serverTimestamp", alias = "server_timestamp")]
    server_timestamp: DateTime<Utc>,
}

/// Decode one frame into an [`Event`].
///
/// Accepts both the unified `type`-tagged shape and the backend change feed's
/// `eventType` shape. Pure: no logging, no state, no I/O.
pub fn decode_frame(text: &str) -> Result<Event, DecodeError> {
    let value: Value = serde_json::from_str(text)?;

    if value.get("eventType").is_some() {
        let wire: MutationWire = serde_json::from_value(value)?;
        let MutationWire {
            event_type,
            task,
            server_timestamp,
        } = wire;
        return match event_type.as_str() {
            "task.created" | "task_created" => Ok(Event::TaskCreated {
                task,
                server_timestamp,
            }),
            "task.updated" | "task_updated" => Ok(Event::TaskUpdated {
                task,
                server_timestamp,
            }),
            "task.deleted" | "task_deleted" => Ok(Event::TaskDeleted {
                task,
                server_timestamp,
            }),
            "task.completed" | "task_completed" => Ok(Event::TaskCompleted {
                task,
                server_timestamp,
            }),
            _ => Err(DecodeError::UnknownKind(event_type)),
        };
    }

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_owned();

    serde_json::from_value::<Event>(value).map_err(|e| {
        if KNOWN_KINDS.contains(&kind.as_str()) {
            DecodeError::Malformed(e)
        } else {
            DecodeError::UnknownKind(kind)
        }
    })
}

// ─── Skip-and-report wrapper ─────────────────────────────────────────────────

/// Decoder front-end used by the sync channel: decode, or skip + report.
pub struct FrameDecoder {
    report_tx: mpsc::Sender<FrameReport>,
}

impl FrameDecoder {
    pub fn new(report_tx: mpsc::Sender<FrameReport>) -> Self {
        Self { report_tx }
    }

    /// Decode one frame. On failure the frame is skipped: a warning is
    /// logged, a report is offered to the error channel (dropped if the
    /// channel is full — reports are best-effort), and `None` is returned
    /// so the caller moves on to the next frame.
    pub fn decode(&self, text: &str) -> Option<Event> {
        match decode_frame(text) {
            Ok(event) => Some(event),
            Err(err) => {
                warn!(err = %err, "skipping frame");
                let _ = self.report_tx.try_send(FrameReport {
                    reason: err.to_string(),
                    frame: truncate(text, REPORT_FRAME_MAX),
                    at: Utc::now(),
                });
                None
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}
