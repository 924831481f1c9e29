// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Worker dispatch and the bounded react loop.
//!
//! Each tool-backed worker is a fresh sub-agent scoped to exactly its tool
//! subset: call the model, execute whatever tool calls it requests, feed
//! the results back, and repeat until the model answers without requesting
//! tools (or the iteration bound is hit). The worker returns one summary
//! message tagged with its name; the supervisor appends it and routes
//! again.
//!
//! The knowledge-base worker runs its own retrieve/grade/rewrite/generate
//! machine in [`kb`]. The two human-interaction kinds never reach this
//! loop: they suspend the graph instead.

pub mod kb;

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::messages::Message;
use crate::model::{ChatModel, ToolDefinition};
use crate::prompts;
use crate::session::Session;
use crate::state::WorkerKind;
use crate::tools::{browser::browser_toolkit, file::file_toolkit, kb::kb_toolkit, shell::shell_toolkit, Tool, ToolInput};

/// Default bound on model/tool iterations within one worker invocation.
pub const DEFAULT_MAX_REACT_ITERATIONS: usize = 8;

/// The tool subset a worker kind is scoped to.
///
/// Exhaustive over the closed worker set; the interrupt kinds carry no
/// tools because they never run a react loop.
#[must_use]
pub fn toolkit_for(kind: WorkerKind, session: &Arc<Session>) -> Vec<Arc<dyn Tool>> {
    match kind {
        WorkerKind::File => file_toolkit(),
        WorkerKind::Shell => shell_toolkit(session),
        WorkerKind::Browser => browser_toolkit(session),
        WorkerKind::KnowledgeBase => kb_toolkit(session),
        WorkerKind::AskUser | WorkerKind::UpdateUser => Vec::new(),
    }
}

/// Run one tool-backed worker to completion.
///
/// Returns the worker's summary message, tagged with the worker's name.
/// Tool failures become tool-result text the model reads on the next
/// iteration - they are never fatal to the worker.
pub async fn run_worker(
    kind: WorkerKind,
    model: &Arc<dyn ChatModel>,
    session: &Arc<Session>,
    instruction: &str,
    max_iterations: usize,
) -> Result<Message> {
    debug_assert!(!kind.is_interrupt(), "interrupt workers suspend the graph");

    let tools = toolkit_for(kind, session);
    let definitions: Vec<ToolDefinition> = tools.iter().map(|t| t.to_definition()).collect();

    let mut messages = vec![
        Message::system(prompts::worker_system_prompt(kind)),
        Message::human(instruction),
    ];

    for iteration in 0..max_iterations {
        let result = model
            .generate(&messages, Some(&definitions), None)
            .await?;
        let reply = result.message;

        if reply.tool_calls().is_empty() {
            let content = reply.as_text().to_string();
            debug!(worker = kind.name(), iteration, "worker finished");
            return Ok(Message::ai(content).with_name(kind.name()));
        }

        let calls = reply.tool_calls().to_vec();
        messages.push(reply);
        for call in calls {
            let text = execute_tool(&tools, &call.name, call.args.clone()).await;
            messages.push(Message::tool(text, call.id, call.name));
        }
    }

    // Iteration bound hit: summarize what we have instead of looping on.
    warn!(worker = kind.name(), "react loop hit its iteration bound");
    let last = messages
        .iter()
        .rev()
        .find(|m| m.is_tool() || m.is_ai())
        .map(|m| m.as_text().to_string())
        .unwrap_or_default();
    Ok(
        Message::ai(format!(
            "Stopped after {max_iterations} tool iterations. Latest result:\n{last}"
        ))
        .with_name(kind.name()),
    )
}

/// Execute one requested tool call, rendering every failure as text.
async fn execute_tool(tools: &[Arc<dyn Tool>], name: &str, args: serde_json::Value) -> String {
    let Some(tool) = tools.iter().find(|t| t.name() == name) else {
        return format!("Error: unknown tool '{name}'");
    };
    match tool.call(ToolInput::Structured(args)).await {
        Ok(result) => {
            let mut text = result.text;
            for image in &result.images {
                // The conversation is text-only; note attached images
                // rather than inlining megabytes of base64.
                text.push_str(&format!(
                    "\n[inline image: {}, {} base64 bytes]",
                    image.content_type,
                    image.data.len()
                ));
            }
            text
        }
        Err(e) => format!("Error: {e}"),
    }
}
