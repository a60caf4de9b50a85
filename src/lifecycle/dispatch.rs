//! Event → step-machine dispatch table.
//!
//! One exhaustive match instead of scattered callbacks: which machine
//! operations each agent event triggers, and what step it produces, lives
//! here and nowhere else, so the mapping is testable on its own.

use serde_json::json;
use tracing::debug;

use crate::events::Event;
use crate::lifecycle::machine::{StepMachine, StepType};

/// Apply one agent event to the machine.
///
/// Task mutation events belong to the reconciliation branch and are ignored
/// here (the pipeline routes them away before this point; tolerating them
/// keeps the function total).
pub fn dispatch(machine: &mut StepMachine, event: &Event) {
    match event {
        Event::AgentStart { agent } => {
            machine.add_step(
                StepType::AgentStart,
                format!("Agent {agent} started"),
                json!({ "agent": agent }),
            );
        }
        Event::AgentEnd { agent } => {
            machine.complete_last_step();
            machine.add_step(
                StepType::AgentEnd,
                format!("Agent {agent} finished"),
                json!({ "agent": agent }),
            );
            // Terminal marker: close it immediately so a finished run never
            // shows an active step.
            machine.complete_last_step();
        }
        Event::LlmStart { agent, model } => {
            machine.complete_last_step();
            machine.add_step(
                StepType::LlmStart,
                format!("{model} thinking"),
                json!({ "agent": agent, "model": model }),
            );
        }
        Event::LlmEnd { agent } => {
            machine.complete_step_by_type(StepType::LlmStart);
            machine.add_step(
                StepType::LlmEnd,
                "Model response received",
                json!({ "agent": agent }),
            );
        }
        Event::McpRequest {
            server,
            tool,
            call_id,
        } => {
            machine.complete_last_step();
            machine.add_step(
                StepType::McpRequest,
                format!("{server}: {tool}"),
                json!({ "server": server, "tool": tool, "call_id": call_id }),
            );
        }
        Event::McpResponse { server, call_id } => {
            // Prefer closing the exact step this response answers; fall back
            // to the type-based matching the progress UI tolerates.
            let matched = call_id
                .as_deref()
                .is_some_and(|id| machine.complete_step_by_call_id(id));
            if !matched {
                machine.complete_step_by_type(StepType::McpRequest);
                machine.complete_step_by_type(StepType::ToolRunning);
            }
            machine.add_step(
                StepType::McpResponse,
                format!("{server} responded"),
                json!({ "server": server, "call_id": call_id }),
            );
        }
        Event::ToolCall { tool, call_id, .. } => {
            machine.complete_last_step();
            machine.add_step(
                StepType::ToolRunning,
                format!("Running {tool}"),
                json!({ "tool": tool, "call_id": call_id }),
            );
        }
        Event::ToolResult { tool, call_id, .. } => {
            let matched = call_id
                .as_deref()
                .is_some_and(|id| machine.complete_step_by_call_id(id));
            if !matched {
                machine.complete_step_by_type(StepType::ToolRunning);
            }
            debug!(tool = %tool, "tool result recorded");
        }
        Event::HandoffRequest {
            from_agent,
            to_agent,
        } => {
            machine.add_step(
                StepType::Handoff,
                format!("Handoff {from_agent} → {to_agent}"),
                json!({ "from": from_agent, "to": to_agent }),
            );
        }
        Event::HandoffComplete {
            from_agent,
            to_agent,
        } => {
            machine.complete_last_step();
            machine.add_step(
                StepType::Handoff,
                format!("{to_agent} took over"),
                json!({ "from": from_agent, "to": to_agent }),
            );
        }
        Event::TaskCreated { .. }
        | Event::TaskUpdated { .. }
        | Event::TaskDeleted { .. }
        | Event::TaskCompleted { .. } => {
            debug!(kind = event.kind(), "task mutation reached lifecycle dispatch — ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::machine::StepStatus;
    use serde_json::json;

    fn feed(events: Vec<Event>) -> StepMachine {
        let mut machine = StepMachine::new();
        for event in &events {
            dispatch(&mut machine, event);
        }
        machine
    }

    #[test]
    fn test_full_run_scenario() {
        // agent_start, llm_start, llm_end, tool_call, tool_result, agent_end.
        let machine = feed(vec![
            Event::AgentStart {
                agent: "Run".into(),
            },
            Event::LlmStart {
                agent: "Run".into(),
                model: "gpt-4o".into(),
            },
            Event::LlmEnd {
                agent: "Run".into(),
            },
            Event::ToolCall {
                tool: "add_task".into(),
                call_id: None,
                arguments: json!({"title": "Buy milk"}),
            },
            Event::ToolResult {
                tool: "add_task".into(),
                call_id: None,
                output: json!({"ok": true}),
            },
            Event::AgentEnd {
                agent: "Run".into(),
            },
        ]);

        let steps = machine.steps();
        assert_eq!(steps.len(), 5);
        assert_eq!(steps[3].step_type, StepType::ToolRunning);
        assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
        assert!(machine.run_finished());
    }

    #[test]
    fn test_mcp_response_closes_interleaved_request() {
        // An mcp_request left open behind a tool_running step must still be
        // closed by its mcp_response.
        let machine = feed(vec![
            Event::McpRequest {
                server: "tasks".into(),
                tool: "list".into(),
                call_id: None,
            },
            Event::ToolCall {
                tool: "read_file".into(),
                call_id: None,
                arguments: json!({}),
            },
            Event::McpResponse {
                server: "tasks".into(),
                call_id: None,
            },
        ]);

        let steps = machine.steps();
        assert_eq!(steps.len(), 3);
        // Both the request and the interleaved tool step are closed; only the
        // response marker stays active until the next event.
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[1].status, StepStatus::Completed);
        assert_eq!(steps[2].status, StepStatus::Active);
    }

    #[test]
    fn test_call_id_closes_the_right_step() {
        let mut machine = StepMachine::new();
        dispatch(
            &mut machine,
            &Event::McpRequest {
                server: "tasks".into(),
                tool: "create".into(),
                call_id: Some("c-1".into()),
            },
        );
        dispatch(
            &mut machine,
            &Event::ToolCall {
                tool: "read_file".into(),
                call_id: Some("c-2".into()),
                arguments: json!({}),
            },
        );
        // The result for c-2 closes the c-2 step specifically, not whatever
        // happens to be the most recent step of the type.
        dispatch(
            &mut machine,
            &Event::ToolResult {
                tool: "read_file".into(),
                call_id: Some("c-2".into()),
                output: json!({}),
            },
        );
        let steps = machine.steps();
        assert_eq!(steps[1].status, StepStatus::Completed);
        assert!(
            steps[1].completed_at.is_some(),
            "c-2 step closed by its own result"
        );
    }

    #[test]
    fn test_handoff_chain() {
        let machine = feed(vec![
            Event::AgentStart {
                agent: "Planner".into(),
            },
            Event::HandoffRequest {
                from_agent: "Planner".into(),
                to_agent: "Executor".into(),
            },
            Event::HandoffComplete {
                from_agent: "Planner".into(),
                to_agent: "Executor".into(),
            },
        ]);
        let steps = machine.steps();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[1].step_type, StepType::Handoff);
        assert_eq!(steps[2].step_type, StepType::Handoff);
        assert_eq!(steps[2].status, StepStatus::Active);
    }

    #[test]
    fn test_task_mutation_is_ignored() {
        use crate::events::Task;
        let machine = feed(vec![Event::TaskCreated {
            task: Task {
                id: 1,
                title: "x".into(),
                description: None,
                completed: false,
                priority: Default::default(),
                due_date: None,
                updated_at: chrono::Utc::now(),
            },
            server_timestamp: chrono::Utc::now(),
        }]);
        assert!(machine.steps().is_empty());
    }
}
