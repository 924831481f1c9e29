// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Conversation message model.
//!
//! Messages are the unit of exchange between the supervisor, workers and the
//! language model. The whole conversation is embedded in checkpointed state,
//! so every message type is serde round-trippable.

use serde::{Deserialize, Serialize};

/// A structured tool-call request attached to an AI message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, echoed back on the tool result message.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Arguments as a JSON object.
    pub args: serde_json::Value,
}

impl ToolCall {
    /// Create a new tool call.
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// A chat message.
///
/// Closed enum over the four roles the orchestrator exchanges. The `name`
/// field tags a message with its producer (a worker name, a tool name) so
/// the supervisor can attribute results when routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    /// System framing ("you are a <specialty> specialist").
    System {
        /// Message text.
        content: String,
    },
    /// Human input: the objective, routing requests, interrupt responses.
    Human {
        /// Message text.
        content: String,
        /// Optional producer tag.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Model output, possibly carrying tool-call requests.
    Ai {
        /// Message text (may be empty when only tool calls are present).
        content: String,
        /// Structured tool-call requests.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        /// Optional producer tag (worker name).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Result of executing a tool call.
    Tool {
        /// Textual tool output (failures are rendered as text too).
        content: String,
        /// Id of the tool call this answers.
        tool_call_id: String,
        /// Name of the tool that ran.
        name: String,
    },
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    /// Create a human message.
    pub fn human(content: impl Into<String>) -> Self {
        Message::Human {
            content: content.into(),
            name: None,
        }
    }

    /// Create an AI message with no tool calls.
    pub fn ai(content: impl Into<String>) -> Self {
        Message::Ai {
            content: content.into(),
            tool_calls: Vec::new(),
            name: None,
        }
    }

    /// Create an AI message carrying tool calls.
    pub fn ai_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Message::Ai {
            content: content.into(),
            tool_calls,
            name: None,
        }
    }

    /// Create a tool result message.
    pub fn tool(
        content: impl Into<String>,
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Message::Tool {
            content: content.into(),
            tool_call_id: tool_call_id.into(),
            name: name.into(),
        }
    }

    /// Tag this message with a producer name (worker or tool).
    #[must_use]
    pub fn with_name(mut self, producer: impl Into<String>) -> Self {
        match &mut self {
            Message::Human { name, .. } | Message::Ai { name, .. } => {
                *name = Some(producer.into());
            }
            Message::Tool { name, .. } => *name = producer.into(),
            Message::System { .. } => {}
        }
        self
    }

    /// The message text.
    pub fn as_text(&self) -> &str {
        match self {
            Message::System { content }
            | Message::Human { content, .. }
            | Message::Ai { content, .. }
            | Message::Tool { content, .. } => content,
        }
    }

    /// Tool calls attached to this message (empty for non-AI messages).
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Message::Ai { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    /// True for human messages.
    pub fn is_human(&self) -> bool {
        matches!(self, Message::Human { .. })
    }

    /// True for AI messages.
    pub fn is_ai(&self) -> bool {
        matches!(self, Message::Ai { .. })
    }

    /// True for tool result messages.
    pub fn is_tool(&self) -> bool {
        matches!(self, Message::Tool { .. })
    }
}
