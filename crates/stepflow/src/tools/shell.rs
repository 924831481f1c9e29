// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Shell tools: thin adapters over the session's shell manager.
//!
//! Every expected failure (unknown shell id, dead process, timeout) is
//! rendered into the result text; the model reads it and adapts.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::error::Error;
use crate::session::shell::{KillOutcome, WaitOutcome};
use crate::session::Session;
use crate::tools::{Tool, ToolInput, ToolResult};

fn render_error(e: &Error) -> String {
    format!("Error: {e}")
}

fn shell_id(input: &ToolInput) -> crate::error::Result<String> {
    input
        .str_field("id")
        .ok_or_else(|| Error::tool_failure("Missing id parameter"))
}

/// Execute a command in a shell session.
pub struct ShellExecTool {
    session: Arc<Session>,
}

impl ShellExecTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for ShellExecTool {
    fn name(&self) -> &str {
        "shell_exec"
    }

    fn description(&self) -> &str {
        "Execute a command in a specified shell session. Use for running code, installing packages, or managing files."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "Unique identifier of the target shell session"},
                "exec_dir": {"type": "string", "description": "Working directory for command execution (absolute path)"},
                "command": {"type": "string", "description": "Shell command to execute"}
            },
            "required": ["id", "exec_dir", "command"]
        })
    }

    async fn call(&self, input: ToolInput) -> crate::error::Result<ToolResult> {
        let id = shell_id(&input)?;
        let dir = input
            .str_field("exec_dir")
            .ok_or_else(|| Error::tool_failure("Missing exec_dir parameter"))?;
        let command = input
            .str_field("command")
            .ok_or_else(|| Error::tool_failure("Missing command parameter"))?;

        match self.session.shells().exec(&id, &dir, &command).await {
            Ok(pid) => Ok(ToolResult::text(format!(
                "Command started in session {id} (pid {})",
                pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())
            ))),
            Err(e) => Ok(ToolResult::text(render_error(&e))),
        }
    }
}

/// View buffered output of a shell session.
pub struct ShellViewTool {
    session: Arc<Session>,
}

impl ShellViewTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for ShellViewTool {
    fn name(&self) -> &str {
        "shell_view"
    }

    fn description(&self) -> &str {
        "View the content of a specified shell session. Use for checking command execution results or monitoring output."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "Unique identifier of the target shell session"}
            },
            "required": ["id"]
        })
    }

    async fn call(&self, input: ToolInput) -> crate::error::Result<ToolResult> {
        let id = shell_id(&input)?;
        match self.session.shells().view(&id, None) {
            Ok(view) => Ok(ToolResult::text(format!(
                "[{}] cwd: {}\n{}",
                if view.running { "running" } else { "finished" },
                view.working_dir,
                view.output
            ))),
            Err(e) => Ok(ToolResult::text(render_error(&e))),
        }
    }
}

/// Wait for a shell session's process to finish.
pub struct ShellWaitTool {
    session: Arc<Session>,
}

impl ShellWaitTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for ShellWaitTool {
    fn name(&self) -> &str {
        "shell_wait"
    }

    fn description(&self) -> &str {
        "Wait for the running process in a specified shell session to return. Use after commands that require a longer runtime."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "Unique identifier of the target shell session"},
                "seconds": {"type": "integer", "description": "(Optional) Wait duration in seconds"}
            },
            "required": ["id"]
        })
    }

    async fn call(&self, input: ToolInput) -> crate::error::Result<ToolResult> {
        let id = shell_id(&input)?;
        let seconds = input.u64_field("seconds");
        match self.session.shells().wait(&id, seconds).await {
            Ok(WaitOutcome::Completed { output, exit_code }) => {
                Ok(ToolResult::text(format!(
                    "Process in session {id} completed with exit code {}.\n{output}",
                    exit_code.map_or_else(|| "unknown (signal)".to_string(), |c| c.to_string())
                )))
            }
            Ok(WaitOutcome::TimedOut { partial_output }) => Ok(ToolResult::text(format!(
                "Process in session {id} still running after {} seconds. Partial output:\n{partial_output}",
                seconds.unwrap_or(0)
            ))),
            Err(e) => Ok(ToolResult::text(render_error(&e))),
        }
    }
}

/// Write to a running process's stdin.
pub struct ShellWriteToProcessTool {
    session: Arc<Session>,
}

impl ShellWriteToProcessTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for ShellWriteToProcessTool {
    fn name(&self) -> &str {
        "shell_write_to_process"
    }

    fn description(&self) -> &str {
        "Write input to a running process in a specified shell session. Use for responding to interactive command prompts."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "Unique identifier of the target shell session"},
                "input": {"type": "string", "description": "Input content to write to the process"},
                "press_enter": {"type": "boolean", "description": "Whether to press the Enter key after the input"}
            },
            "required": ["id", "input", "press_enter"]
        })
    }

    async fn call(&self, input: ToolInput) -> crate::error::Result<ToolResult> {
        let id = shell_id(&input)?;
        let text = input
            .str_field("input")
            .ok_or_else(|| Error::tool_failure("Missing input parameter"))?;
        let press_enter = input.bool_field("press_enter").unwrap_or(true);
        match self
            .session
            .shells()
            .write_stdin(&id, &text, press_enter)
            .await
        {
            Ok(()) => Ok(ToolResult::text(format!(
                "Input written to process in session {id}"
            ))),
            Err(e) => Ok(ToolResult::text(render_error(&e))),
        }
    }
}

/// Terminate a running process.
pub struct ShellKillProcessTool {
    session: Arc<Session>,
}

impl ShellKillProcessTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for ShellKillProcessTool {
    fn name(&self) -> &str {
        "shell_kill_process"
    }

    fn description(&self) -> &str {
        "Terminate a running process in a specified shell session. Use for stopping long-running processes or handling frozen commands."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "Unique identifier of the target shell session"}
            },
            "required": ["id"]
        })
    }

    async fn call(&self, input: ToolInput) -> crate::error::Result<ToolResult> {
        let id = shell_id(&input)?;
        match self.session.shells().kill(&id).await {
            Ok(KillOutcome::Terminated) => {
                Ok(ToolResult::text(format!("Process in session {id} terminated")))
            }
            Ok(KillOutcome::AlreadyCompleted { exit_code }) => Ok(ToolResult::text(format!(
                "Process in session {id} already completed with exit code {}",
                exit_code.map_or_else(|| "unknown (signal)".to_string(), |c| c.to_string())
            ))),
            Err(e) => Ok(ToolResult::text(render_error(&e))),
        }
    }
}

/// The complete shell toolkit bound to a session.
#[must_use]
pub fn shell_toolkit(session: &Arc<Session>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ShellExecTool::new(Arc::clone(session))),
        Arc::new(ShellViewTool::new(Arc::clone(session))),
        Arc::new(ShellWaitTool::new(Arc::clone(session))),
        Arc::new(ShellWriteToProcessTool::new(Arc::clone(session))),
        Arc::new(ShellKillProcessTool::new(Arc::clone(session))),
    ]
}
