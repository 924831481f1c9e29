// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Graph state: the plan, its history and the routing fields.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::messages::Message;

/// The closed set of workers the supervisor can route to.
///
/// String-based dispatch is deliberately avoided: every routing site
/// matches exhaustively on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// File operations specialist.
    File,
    /// Shell command specialist.
    Shell,
    /// Web browsing specialist.
    Browser,
    /// Knowledge-base retrieval specialist.
    KnowledgeBase,
    /// Requests input from the human user (suspends the run).
    AskUser,
    /// Delivers a notification to the human user (suspends, resumes
    /// without new input).
    UpdateUser,
}

impl WorkerKind {
    /// All workers, in routing-prompt order.
    pub const ALL: [WorkerKind; 6] = [
        WorkerKind::File,
        WorkerKind::Shell,
        WorkerKind::Browser,
        WorkerKind::KnowledgeBase,
        WorkerKind::AskUser,
        WorkerKind::UpdateUser,
    ];

    /// The worker's wire name, used in routing schemas and message tags.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            WorkerKind::File => "file_worker",
            WorkerKind::Shell => "shell_worker",
            WorkerKind::Browser => "browser_worker",
            WorkerKind::KnowledgeBase => "kb_worker",
            WorkerKind::AskUser => "ask_user",
            WorkerKind::UpdateUser => "update_user",
        }
    }

    /// Parse a wire name back into a kind.
    #[must_use]
    pub fn from_name(name: &str) -> Option<WorkerKind> {
        WorkerKind::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Whether this worker suspends the run awaiting the human.
    #[must_use]
    pub fn is_interrupt(&self) -> bool {
        matches!(self, WorkerKind::AskUser | WorkerKind::UpdateUser)
    }
}

/// Routing decision: a worker, or the terminal sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Dispatch to a worker.
    Worker(WorkerKind),
    /// The current step is complete.
    #[default]
    Finish,
}

/// One plan step.
///
/// Deserialization is defensive: a step arriving without a description or
/// substeps is coerced to empty values rather than failing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Step {
    /// What this step accomplishes.
    #[serde(default)]
    pub description: String,
    /// How to accomplish it, broken down.
    #[serde(default)]
    pub substeps: Vec<String>,
}

impl Step {
    /// Create a step.
    pub fn new(description: impl Into<String>, substeps: Vec<String>) -> Self {
        Self {
            description: description.into(),
            substeps,
        }
    }
}

/// A completed step and its result text. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PastStep {
    /// Description of the executed step.
    pub step: String,
    /// Result text recorded when the step finished.
    pub result: String,
}

/// The orchestrator's full mutable state, embedded in every checkpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentState {
    /// The user objective.
    #[serde(default)]
    pub input: String,
    /// Remaining plan, consumed head-first.
    #[serde(default)]
    pub plan: VecDeque<Step>,
    /// Completed steps with results; never removed.
    #[serde(default)]
    pub past_steps: Vec<PastStep>,
    /// Final response once the replanner terminates the run.
    #[serde(default)]
    pub response: Option<String>,
    /// Deduplicated source identifiers from knowledge-base retrieval.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Conversation so far.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Last routing decision.
    #[serde(default)]
    pub next: Route,
    /// Instruction for the routed worker.
    #[serde(default)]
    pub instruction: String,
    /// Replanner cycles consumed (bounded by the run config).
    #[serde(default)]
    pub replan_cycles: u32,
}

impl AgentState {
    /// Fresh state for an objective.
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    /// Text of the most recent message, or empty.
    #[must_use]
    pub fn last_message_text(&self) -> String {
        self.messages
            .last()
            .map(|m| m.as_text().to_string())
            .unwrap_or_default()
    }

    /// Whether a non-empty final response has been produced.
    #[must_use]
    pub fn has_response(&self) -> bool {
        self.response.as_deref().is_some_and(|r| !r.is_empty())
    }
}
