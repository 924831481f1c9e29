// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Supervisor: the per-cycle router.
//!
//! Given the conversation so far and the current plan step, asks the model
//! to pick exactly one worker (or the terminal sentinel) plus a free-text
//! instruction for it. A model response with no structured choice, or with
//! a worker name outside the closed set, fails closed to the terminal
//! sentinel.

use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::messages::Message;
use crate::model::{structured_output, ChatModel};
use crate::prompts;
use crate::state::{AgentState, Route, Step, WorkerKind};

/// The supervisor's routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorDecision {
    /// Dispatch the instruction to a worker.
    Dispatch {
        /// The chosen worker.
        kind: WorkerKind,
        /// Instruction text for the worker.
        instruction: String,
    },
    /// The current step is complete.
    Finish,
}

/// Raw arguments the model fills for the routing function.
#[derive(Debug, Deserialize)]
struct RouterArgs {
    next: String,
    #[serde(default)]
    instruction: String,
}

/// JSON Schema for the routing function: one worker name or FINISH, plus
/// an instruction.
fn router_schema() -> serde_json::Value {
    let mut options: Vec<&str> = WorkerKind::ALL.iter().map(|k| k.name()).collect();
    options.push("FINISH");
    json!({
        "type": "object",
        "properties": {
            "next": {
                "type": "string",
                "enum": options,
                "description": "The worker to route to, or FINISH if the task is complete"
            },
            "instruction": {
                "type": "string",
                "description": "Detailed instructions for the selected worker"
            }
        },
        "required": ["next", "instruction"]
    })
}

/// Ask the model to route the current step.
pub async fn route(
    model: &Arc<dyn ChatModel>,
    state: &AgentState,
    task: &Step,
) -> Result<SupervisorDecision> {
    let mut messages = vec![Message::system(prompts::supervisor_system_prompt())];
    messages.extend(state.messages.iter().cloned());
    messages.push(Message::human(prompts::supervisor_task_prompt(task)));

    let routed: Option<RouterArgs> = structured_output(
        model,
        &messages,
        "route",
        "Select the next worker and give it instructions",
        router_schema(),
    )
    .await?;

    let decision = match routed {
        // No structured choice at all: default to the terminal sentinel.
        None => SupervisorDecision::Finish,
        Some(args) => match args.next.as_str() {
            "FINISH" => SupervisorDecision::Finish,
            name => match WorkerKind::from_name(name) {
                Some(kind) => SupervisorDecision::Dispatch {
                    kind,
                    instruction: args.instruction,
                },
                // Unknown worker name: fail closed rather than dispatch
                // into the void.
                None => SupervisorDecision::Finish,
            },
        },
    };
    debug!(?decision, task = %task.description, "supervisor routed");
    Ok(decision)
}

/// Apply a dispatch decision to state (routing fields only).
pub fn apply_dispatch(state: &mut AgentState, kind: WorkerKind, instruction: &str) {
    state.next = Route::Worker(kind);
    state.instruction = instruction.to_string();
}

/// Apply a finish decision: pop the consumed step and record its result.
///
/// The result text is the content of the most recent message - the last
/// worker summary the supervisor saw before declaring the step done.
pub fn apply_finish(state: &mut AgentState) {
    if let Some(step) = state.plan.pop_front() {
        let result = state.last_message_text();
        state.past_steps.push(crate::state::PastStep {
            step: step.description,
            result,
        });
    }
    state.next = Route::Finish;
}
