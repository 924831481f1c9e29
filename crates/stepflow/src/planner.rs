// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Planner and replanner.
//!
//! The planner decomposes the objective into an ordered list of steps with
//! substeps in a single model call. After every supervisor cycle the
//! replanner either restates the remaining plan or emits the final
//! response. Replanning never reintroduces a step that already appears in
//! past-steps.

use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::messages::Message;
use crate::model::{structured_choice, structured_output, ChatModel, ToolDefinition};
use crate::prompts;
use crate::state::{AgentState, Step};

/// Structured plan as the model produces it.
#[derive(Debug, Default, Deserialize)]
struct PlanArgs {
    #[serde(default)]
    steps: Vec<Step>,
}

/// Structured final response.
#[derive(Debug, Deserialize)]
struct RespondArgs {
    #[serde(default)]
    response: String,
}

/// The replanner's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplanAction {
    /// Continue with this remaining plan.
    Plan(VecDeque<Step>),
    /// Terminate with this final response.
    Respond(String),
}

fn plan_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "steps": {
                "type": "array",
                "description": "A list of high-level sequential steps with detailed expansions",
                "items": {
                    "type": "object",
                    "properties": {
                        "description": {"type": "string", "description": "A description of the step"},
                        "substeps": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "1-4 substeps that break down how to accomplish this step"
                        }
                    },
                    "required": ["description", "substeps"]
                }
            }
        },
        "required": ["steps"]
    })
}

fn respond_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "response": {"type": "string", "description": "The final response to the user"}
        },
        "required": ["response"]
    })
}

/// Produce the initial plan for an objective.
pub async fn plan(model: &Arc<dyn ChatModel>, objective: &str) -> Result<VecDeque<Step>> {
    let messages = vec![Message::human(prompts::planner_prompt(objective))];
    let planned: Option<PlanArgs> = structured_output(
        model,
        &messages,
        "plan",
        "Produce the step-by-step plan",
        plan_schema(),
    )
    .await?;

    let steps = planned.unwrap_or_default().steps;
    debug!(step_count = steps.len(), "planner produced plan");
    Ok(normalize_steps(steps).collect())
}

/// Replan the remaining work, or produce the final response.
///
/// The model picks exactly one of two functions: `plan` (restate the
/// remaining steps) or `respond` (terminate with the final answer). A
/// response with no structured choice terminates with an empty response
/// rather than looping. Steps whose descriptions already appear in
/// past-steps are dropped from the restated plan.
pub async fn replan(model: &Arc<dyn ChatModel>, state: &AgentState) -> Result<ReplanAction> {
    let messages = vec![Message::human(prompts::replanner_prompt(
        &state.input,
        &state.plan,
        &state.past_steps,
    ))];
    let definitions = vec![
        ToolDefinition {
            name: "plan".to_string(),
            description:
                "Restate the remaining steps when further work is needed to reach the answer"
                    .to_string(),
            parameters: plan_schema(),
        },
        ToolDefinition {
            name: "respond".to_string(),
            description: "Respond to the user when no more steps are needed".to_string(),
            parameters: respond_schema(),
        },
    ];

    let Some((name, args)) = structured_choice(model, &messages, &definitions).await? else {
        debug!("replanner made no structured choice; terminating");
        return Ok(ReplanAction::Respond(String::new()));
    };

    match name.as_str() {
        "respond" => {
            let parsed: RespondArgs =
                serde_json::from_value(args).unwrap_or(RespondArgs {
                    response: String::new(),
                });
            Ok(ReplanAction::Respond(parsed.response))
        }
        _ => {
            let parsed: PlanArgs = serde_json::from_value(args).unwrap_or_default();
            let completed: Vec<&str> = state
                .past_steps
                .iter()
                .map(|p| p.step.as_str())
                .collect();
            let steps: VecDeque<Step> = normalize_steps(parsed.steps)
                .filter(|step| !completed.contains(&step.description.as_str()))
                .collect();
            Ok(ReplanAction::Plan(steps))
        }
    }
}

/// Coerce malformed steps instead of failing: missing fields become empty,
/// and fully empty steps are dropped.
fn normalize_steps(steps: Vec<Step>) -> impl Iterator<Item = Step> {
    steps
        .into_iter()
        .filter(|step| !step.description.is_empty() || !step.substeps.is_empty())
}
